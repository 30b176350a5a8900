const NIL: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct SlotMeta {
    bucket: u32,
    rounds: u8,
    prev: u32,
    next: u32,
}

impl SlotMeta {
    const fn unlinked(slots: u32) -> Self {
        Self {
            bucket: slots, // bucket == slots marks "not linked"
            rounds: 0,
            prev: NIL,
            next: NIL,
        }
    }
}

/// Hashed timer wheel: one slot per connection, O(1) schedule/cancel.
///
/// `slots` must be a power of two; a slot expires when its bucket comes
/// around with `rounds == 0`. Each `tick` advances exactly one step, so a
/// caller that fell behind catches up deterministically.
///
/// Expired slots are drained into a caller vector rather than delivered
/// through a stored callback; each is unlinked before it is reported, so the
/// exactly-once contract holds and the caller may `cancel` other slots while
/// processing (rescheduling the reported slot from inside its own expiration
/// is not supported).
pub struct TimerWheel {
    meta: Vec<SlotMeta>,
    heads: Vec<u32>,
    slots: u32,
    mask: u64,
    shift: u32,
    tick_val: u64,
    now_tick: u64,
}

impl TimerWheel {
    /// `tick_val` is the tick interval in the caller's time unit (seconds for
    /// the reactor); `wheel_slots` must be a power of two.
    pub fn new(capacity: u32, wheel_slots: u32, tick_val: u64) -> Self {
        assert!(
            wheel_slots.is_power_of_two(),
            "timer wheel slot count must be a power of two"
        );

        Self {
            meta: vec![SlotMeta::unlinked(wheel_slots); capacity as usize],
            heads: vec![NIL; wheel_slots as usize],
            slots: wheel_slots,
            mask: (wheel_slots - 1) as u64,
            shift: wheel_slots.trailing_zeros(),
            tick_val: tick_val.max(1),
            now_tick: 0,
        }
    }

    pub fn now_tick(&self) -> u64 {
        self.now_tick
    }

    /// (Re)schedule `pos` to expire `timeout` time units from now. An already
    /// scheduled slot is unlinked first.
    pub fn schedule(&mut self, pos: u32, timeout: u64) {
        assert!((pos as usize) < self.meta.len(), "timer wheel slot {pos} out of range");

        self.unlink(pos);

        let ticks = if self.tick_val > 1 {
            if self.tick_val.is_power_of_two() {
                timeout >> self.tick_val.trailing_zeros()
            } else {
                timeout / self.tick_val
            }
        } else {
            timeout
        };

        let expire_tick = self.now_tick + ticks;
        let bucket = (expire_tick & self.mask) as u32;
        let rounds = ((expire_tick >> self.shift) - (self.now_tick >> self.shift)) as u8;

        let head = self.heads[bucket as usize];
        {
            let m = &mut self.meta[pos as usize];
            m.bucket = bucket;
            m.rounds = rounds;
            m.next = head;
            m.prev = NIL;
        }
        if head != NIL {
            self.meta[head as usize].prev = pos;
        }
        self.heads[bucket as usize] = pos;
    }

    pub fn cancel(&mut self, pos: u32) {
        assert!((pos as usize) < self.meta.len(), "timer wheel slot {pos} out of range");
        self.unlink(pos);
    }

    /// Advance to `now_tick`, one step at a time, pushing expired slot ids
    /// into `expired`.
    pub fn tick(&mut self, now_tick: u64, expired: &mut Vec<u32>) {
        while self.now_tick < now_tick {
            let bucket = (self.now_tick & self.mask) as usize;
            let mut curr = self.heads[bucket];

            while curr != NIL {
                let next = self.meta[curr as usize].next;
                if self.meta[curr as usize].rounds == 0 {
                    self.unlink(curr);
                    expired.push(curr);
                } else {
                    self.meta[curr as usize].rounds -= 1;
                }
                curr = next;
            }

            self.now_tick += 1;
        }
    }

    pub fn is_scheduled(&self, pos: u32) -> bool {
        self.meta[pos as usize].bucket < self.slots
    }

    fn unlink(&mut self, pos: u32) {
        let (bucket, prev, next) = {
            let m = &self.meta[pos as usize];
            (m.bucket, m.prev, m.next)
        };
        if bucket >= self.slots {
            return; // not linked
        }

        if prev != NIL {
            self.meta[prev as usize].next = next;
        } else if self.heads[bucket as usize] == pos {
            self.heads[bucket as usize] = next;
        }
        if next != NIL {
            self.meta[next as usize].prev = prev;
        }

        self.meta[pos as usize] = SlotMeta::unlinked(self.slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(wheel: &mut TimerWheel, to: u64) -> Vec<u32> {
        let mut out = Vec::new();
        wheel.tick(to, &mut out);
        out
    }

    #[test]
    fn expires_at_the_right_tick() {
        let mut wheel = TimerWheel::new(16, 8, 1);
        wheel.schedule(3, 5);

        assert!(drain(&mut wheel, 5).is_empty());
        assert_eq!(drain(&mut wheel, 6), vec![3]);
        assert!(!wheel.is_scheduled(3));
    }

    #[test]
    fn rounds_survive_a_full_revolution() {
        let mut wheel = TimerWheel::new(4, 8, 1);
        // 13 ticks on an 8-slot wheel needs one extra round
        wheel.schedule(0, 13);
        assert!(drain(&mut wheel, 13).is_empty());
        assert_eq!(drain(&mut wheel, 14), vec![0]);
    }

    #[test]
    fn reschedule_moves_the_deadline() {
        let mut wheel = TimerWheel::new(4, 8, 1);
        wheel.schedule(1, 2);
        wheel.schedule(1, 6); // keep-alive refresh
        assert!(drain(&mut wheel, 6).is_empty());
        assert_eq!(drain(&mut wheel, 7), vec![1]);
    }

    #[test]
    fn cancel_prevents_expiry() {
        let mut wheel = TimerWheel::new(4, 8, 1);
        wheel.schedule(2, 3);
        wheel.cancel(2);
        assert!(drain(&mut wheel, 10).is_empty());
    }

    #[test]
    fn fires_exactly_once() {
        let mut wheel = TimerWheel::new(4, 8, 1);
        wheel.schedule(1, 1);
        assert_eq!(drain(&mut wheel, 2), vec![1]);
        assert!(drain(&mut wheel, 40).is_empty());
    }

    #[test]
    fn several_slots_in_one_bucket() {
        let mut wheel = TimerWheel::new(8, 8, 1);
        wheel.schedule(1, 2);
        wheel.schedule(5, 2);
        wheel.schedule(7, 2);
        let mut fired = drain(&mut wheel, 3);
        fired.sort_unstable();
        assert_eq!(fired, vec![1, 5, 7]);
    }

    #[test]
    fn tick_interval_divides_timeouts() {
        let mut wheel = TimerWheel::new(4, 8, 4);
        wheel.schedule(0, 8); // 8 units / 4 per tick = 2 ticks
        assert!(drain(&mut wheel, 2).is_empty());
        assert_eq!(drain(&mut wheel, 3), vec![0]);
    }
}
