// Fixed-capacity request/reply slot shared by a blocking caller and its helper

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// Outcome of a caller waiting on the channel
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    Reply(String),
    TimedOut,
    Retired,
}

#[derive(Default)]
struct Slot {
    seq: u64,
    request: Option<(u64, String)>,
    reply: Option<(u64, String)>,
    retired: bool,
}

/// One outstanding request at a time, signalled through two condition variables
pub(crate) struct Channel {
    capacity: usize,
    slot: Mutex<Slot>,
    to_helper: Condvar,
    to_caller: Condvar,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slot: Mutex::new(Slot::default()),
            to_helper: Condvar::new(),
            to_caller: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Caller side: write a request and wake the helper, returns its sequence number
    pub fn post_request(&self, payload: String) -> u64 {
        let mut slot = self.slot.lock();
        slot.seq += 1;
        let seq = slot.seq;
        slot.request = Some((seq, payload));
        slot.reply = None;
        self.to_helper.notify_one();
        seq
    }

    /// Caller side: park until the reply for `seq` arrives or `deadline` passes
    pub fn wait_reply(&self, seq: u64, deadline: Option<Instant>) -> Wait {
        let mut slot = self.slot.lock();
        loop {
            if slot.reply.as_ref().map(|(s, _)| *s) == Some(seq) {
                if let Some((_, reply)) = slot.reply.take() {
                    return Wait::Reply(reply);
                }
            }
            if slot.retired {
                return Wait::Retired;
            }
            match deadline {
                Some(deadline) => {
                    if self.to_caller.wait_until(&mut slot, deadline).timed_out()
                        && slot.reply.as_ref().map(|(s, _)| *s) != Some(seq)
                    {
                        return Wait::TimedOut;
                    }
                }
                None => self.to_caller.wait(&mut slot),
            }
        }
    }

    /// Helper side: park until a request arrives; `None` once retired
    pub fn next_request(&self) -> Option<(u64, String)> {
        let mut slot = self.slot.lock();
        loop {
            if slot.retired {
                return None;
            }
            if let Some(request) = slot.request.take() {
                return Some(request);
            }
            self.to_helper.wait(&mut slot);
        }
    }

    /// Helper side: publish the reply for `seq`; stale replies are dropped
    pub fn post_reply(&self, seq: u64, payload: String) {
        let mut slot = self.slot.lock();
        if slot.seq == seq && !slot.retired {
            slot.reply = Some((seq, payload));
            self.to_caller.notify_all();
        }
    }

    /// Stop the helper after its current request and wake every waiter
    pub fn retire(&self) {
        let mut slot = self.slot.lock();
        slot.retired = true;
        slot.request = None;
        self.to_helper.notify_all();
        self.to_caller.notify_all();
    }

    pub fn is_retired(&self) -> bool {
        self.slot.lock().retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn request_reply_round_trip() {
        let channel = Arc::new(Channel::new(64));
        let helper = {
            let channel = channel.clone();
            thread::spawn(move || {
                let (seq, request) = channel.next_request().unwrap();
                channel.post_reply(seq, request.to_uppercase());
            })
        };

        let seq = channel.post_request("ping".to_string());
        assert_eq!(
            channel.wait_reply(seq, None),
            Wait::Reply("PING".to_string())
        );
        helper.join().unwrap();
    }

    #[test]
    fn waiting_past_the_deadline_times_out() {
        let channel = Channel::new(64);
        let seq = channel.post_request("slow".to_string());
        let started = Instant::now();
        let outcome = channel.wait_reply(seq, Some(started + Duration::from_millis(30)));
        assert_eq!(outcome, Wait::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn stale_replies_are_ignored() {
        let channel = Channel::new(64);
        let first = channel.post_request("a".to_string());
        let second = channel.post_request("b".to_string());
        channel.post_reply(first, "late".to_string());
        let outcome = channel.wait_reply(second, Some(Instant::now() + Duration::from_millis(10)));
        assert_eq!(outcome, Wait::TimedOut);
    }

    #[test]
    fn retire_releases_the_helper() {
        let channel = Arc::new(Channel::new(64));
        let helper = {
            let channel = channel.clone();
            thread::spawn(move || channel.next_request())
        };
        thread::sleep(Duration::from_millis(10));
        channel.retire();
        assert!(helper.join().unwrap().is_none());
        assert!(channel.is_retired());
    }
}
