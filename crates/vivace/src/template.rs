use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files starting with this tag are partials: only ever included, never
/// compiled or served on their own.
const PARTIAL_TAG: &[u8] = b"{% partial %}";
const INCLUDE_OPEN: &str = "{% include";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    /// No include tags; the output is a byte copy of the input.
    PureStatic,
    /// At least one include was expanded at compile time.
    CompiledStatic,
}

pub struct TemplateMeta {
    pub kind: TemplateKind,
    pub size: u64,
    /// Absolute-ish path of the compiled artifact. Shared so responses can
    /// hold it without copying; the map never changes after `precompile`.
    pub full_path: Arc<str>,
}

/// Template precompiler and lookup map.
///
/// `precompile` walks the template root once, expands `{% include '<p>' %}`
/// lines recursively through an explicit frame stack, and writes the results
/// under `<project>/build/templates/static/` mirroring the input tree. The
/// map is immutable afterwards; there is deliberately no mutating API.
///
/// Include cycles are not detected; that is a documented precondition on
/// template authors.
pub struct TemplateEngine {
    templates: HashMap<String, TemplateMeta>,
}

impl TemplateEngine {
    /// Build an empty engine (projects without templates).
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Walk `template_dir` and compile every `.html` file that is not a
    /// partial. Failures are logged and the affected template is skipped;
    /// the rest of the tree still compiles.
    pub fn precompile(template_dir: &str, project_root: &str) -> Self {
        let mut engine = Self::empty();
        let input_root = Path::new(template_dir);
        let output_root = Path::new(project_root).join("build/templates/static");

        if !input_root.is_dir() {
            tracing::info!("template dir '{template_dir}' not found; no templates registered");
            return engine;
        }
        if let Err(e) = fs::create_dir_all(&output_root) {
            tracing::error!("cannot create template output dir {}: {e}", output_root.display());
            return engine;
        }

        let mut inputs = Vec::new();
        collect_html(input_root, &mut inputs);
        inputs.sort(); // stable traversal keeps recompiles byte-identical

        let mut errors = 0usize;
        for in_path in inputs {
            let rel = match in_path.strip_prefix(input_root) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };

            match is_partial(&in_path) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    errors += 1;
                    tracing::error!("cannot inspect template {}: {e}", in_path.display());
                    continue;
                }
            }

            let out_path = output_root.join(&rel);
            if let Some(parent) = out_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    errors += 1;
                    tracing::error!("cannot create {}: {e}", parent.display());
                    continue;
                }
            }

            match compile_one(input_root, &in_path, &out_path) {
                Ok((kind, size)) => {
                    let full_path: Arc<str> = Arc::from(out_path.to_string_lossy().as_ref());
                    engine.templates.insert(rel, TemplateMeta { kind, size, full_path });
                }
                Err(e) => {
                    errors += 1;
                    tracing::error!("failed to compile template {}: {e}", in_path.display());
                }
            }
        }

        if errors > 0 {
            tracing::warn!("template precompilation finished with {errors} error(s)");
        } else {
            tracing::info!("precompiled {} template(s)", engine.templates.len());
        }
        engine
    }

    /// Lookup by path relative to the template root (no leading slash).
    pub fn get(&self, rel_path: &str) -> Option<&TemplateMeta> {
        self.templates.get(rel_path)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn collect_html(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_html(&path, out);
        } else if path.extension().is_some_and(|e| e == "html") {
            out.push(path);
        }
    }
}

fn is_partial(path: &Path) -> std::io::Result<bool> {
    let mut head = [0u8; PARTIAL_TAG.len()];
    let mut f = File::open(path)?;
    let n = f.read(&mut head)?;
    Ok(n == PARTIAL_TAG.len() && head == *PARTIAL_TAG)
}

struct Frame {
    reader: BufReader<File>,
    first_line: bool,
}

/// Expand one template into `out_path` with an explicit include stack.
fn compile_one(input_root: &Path, in_path: &Path, out_path: &Path) -> std::io::Result<(TemplateKind, u64)> {
    let mut out = File::create(out_path)?;
    let mut found_include = false;
    let mut size: u64 = 0;

    let mut stack = vec![Frame {
        reader: BufReader::new(File::open(in_path)?),
        first_line: true,
    }];

    while let Some(frame) = stack.last_mut() {
        let mut line = String::new();
        let n = frame.reader.read_line(&mut line)?;
        if n == 0 {
            stack.pop();
            continue;
        }

        // A partial's tag line is dropped when it is pulled in
        if frame.first_line {
            frame.first_line = false;
            if line.as_bytes().starts_with(PARTIAL_TAG) {
                continue;
            }
        }

        match parse_include(&line) {
            IncludeLine::None => {
                out.write_all(line.as_bytes())?;
                size += line.len() as u64;
            }
            IncludeLine::Include(rel) => {
                found_include = true;
                let include_path = input_root.join(&rel);
                let file = File::open(&include_path).map_err(|e| {
                    std::io::Error::new(e.kind(), format!("include '{rel}' unreadable: {e}"))
                })?;
                stack.push(Frame {
                    reader: BufReader::new(file),
                    first_line: true,
                });
            }
            IncludeLine::Malformed => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("malformed include tag: {}", line.trim_end()),
                ));
            }
        }
    }

    out.flush()?;
    let kind = if found_include {
        TemplateKind::CompiledStatic
    } else {
        TemplateKind::PureStatic
    };
    Ok((kind, size))
}

enum IncludeLine {
    None,
    Include(String),
    Malformed,
}

/// `{% include '<relpath>' %}` with either quote style.
fn parse_include(line: &str) -> IncludeLine {
    let Some(tag_pos) = line.find(INCLUDE_OPEN) else {
        return IncludeLine::None;
    };
    let Some(tag_end) = line[tag_pos..].find("%}") else {
        return IncludeLine::Malformed;
    };

    let body = &line[tag_pos + 2..tag_pos + tag_end];
    let Some(q1) = body.find(['\'', '"']) else {
        return IncludeLine::Malformed;
    };
    let Some(q2) = body.rfind(['\'', '"']) else {
        return IncludeLine::Malformed;
    };
    if q2 <= q1 {
        return IncludeLine::Malformed;
    }

    IncludeLine::Include(body[q1 + 1..q2].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scratch {
        root: PathBuf,
    }

    impl Scratch {
        fn new(tag: &str) -> Self {
            let root = std::env::temp_dir().join(format!("vivace-tpl-{}-{}", tag, std::process::id()));
            let _ = fs::remove_dir_all(&root);
            fs::create_dir_all(root.join("templates")).unwrap();
            Self { root }
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.root.join("templates").join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn compile(&self) -> TemplateEngine {
            TemplateEngine::precompile(
                self.root.join("templates").to_str().unwrap(),
                self.root.to_str().unwrap(),
            )
        }

        fn output(&self, rel: &str) -> String {
            fs::read_to_string(self.root.join("build/templates/static").join(rel)).unwrap()
        }
    }

    #[test]
    fn pure_static_copies_bytes() {
        let s = Scratch::new("pure");
        s.write("index.html", "<html>\n<body>hi</body>\n</html>\n");

        let engine = s.compile();
        let meta = engine.get("index.html").unwrap();
        assert_eq!(meta.kind, TemplateKind::PureStatic);
        assert_eq!(meta.size, s.output("index.html").len() as u64);
        assert_eq!(s.output("index.html"), "<html>\n<body>hi</body>\n</html>\n");
    }

    #[test]
    fn includes_expand_recursively() {
        let s = Scratch::new("inc");
        s.write("page.html", "<header/>\n{% include 'partials/nav.html' %}\n<footer/>\n");
        s.write("partials/nav.html", "{% partial %}\n<nav>\n{% include \"partials/item.html\" %}\n</nav>\n");
        s.write("partials/item.html", "{% partial %}\n<item/>\n");

        let engine = s.compile();
        let meta = engine.get("page.html").unwrap();
        assert_eq!(meta.kind, TemplateKind::CompiledStatic);
        assert_eq!(s.output("page.html"), "<header/>\n<nav>\n<item/>\n</nav>\n<footer/>\n");
    }

    #[test]
    fn partials_are_not_registered_or_emitted() {
        let s = Scratch::new("part");
        s.write("page.html", "<p/>\n");
        s.write("partials/nav.html", "{% partial %}\n<nav/>\n");

        let engine = s.compile();
        assert!(engine.get("page.html").is_some());
        assert!(engine.get("partials/nav.html").is_none());
        assert!(!s.root.join("build/templates/static/partials/nav.html").exists());
    }

    #[test]
    fn missing_include_skips_the_template() {
        let s = Scratch::new("missing");
        s.write("ok.html", "<ok/>\n");
        s.write("broken.html", "{% include 'partials/ghost.html' %}\n");

        let engine = s.compile();
        assert!(engine.get("ok.html").is_some());
        assert!(engine.get("broken.html").is_none());
    }

    #[test]
    fn precompile_is_idempotent() {
        let s = Scratch::new("idem");
        s.write("a.html", "<a/>\n{% include 'b.html' %}\n");
        s.write("b.html", "{% partial %}\n<b/>\n");

        s.compile();
        let first = s.output("a.html");
        let engine = s.compile();
        assert_eq!(s.output("a.html"), first);
        assert_eq!(engine.get("a.html").unwrap().size, first.len() as u64);
    }

    #[test]
    fn include_accepts_both_quote_styles() {
        match parse_include("{% include 'x.html' %}\n") {
            IncludeLine::Include(p) => assert_eq!(p, "x.html"),
            _ => panic!("single quotes must parse"),
        }
        match parse_include("{% include \"y.html\" %}\n") {
            IncludeLine::Include(p) => assert_eq!(p, "y.html"),
            _ => panic!("double quotes must parse"),
        }
        assert!(matches!(parse_include("plain line\n"), IncludeLine::None));
        assert!(matches!(parse_include("{% include x %}\n"), IncludeLine::Malformed));
    }
}
