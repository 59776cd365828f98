use std::fmt;
use std::time;

use chrono::{DateTime, Duration, Utc};
use tokio::time::{interval, Interval};

use super::SessionError;
use crate::message::Notification;
use crate::utils::{format_elapsed_time, get_elapsed_time};

/// Receive and send timers for one session [RFC 4271 Sect. 4.4].
///
/// The receive side expires when nothing has arrived for more than the
/// hold time; the send side is due every hold_time / 3. A hold time of
/// zero disables both, except that a second KEEPALIVE received on a
/// zero-hold session is a protocol error.
#[derive(Debug)]
pub struct HoldTimer {
    pub(crate) hold_time: u16,
    pub(crate) interval: u16,
    timer: Interval,
    pub(crate) last_sent: DateTime<Utc>,
    pub(crate) last_received: DateTime<Utc>,
    /// One keepalive already seen while hold time is zero
    zero_hold_seen: bool,
}

impl HoldTimer {
    pub fn new(hold_time: u16) -> HoldTimer {
        HoldTimer {
            hold_time,
            interval: hold_time / 3,
            timer: interval(time::Duration::from_millis(100)),
            last_received: Utc::now(),
            last_sent: Utc::now(),
            zero_hold_seen: false,
        }
    }

    /// Wait one timer tick, then report whether a KEEPALIVE is due.
    /// Raises the hold-timer-expired fault when the peer has gone quiet.
    pub async fn should_send_keepalive(&mut self) -> Result<bool, SessionError> {
        self.timer.tick().await;
        if self.hold_time == 0 {
            return Ok(false);
        }
        if self.is_expired() {
            return Err(SessionError::HoldTimeExpired(self.hold_time));
        }
        Ok(self.need_keepalive())
    }

    /// A KEEPALIVE is due when a third of the hold time has elapsed
    /// since we last sent anything
    fn need_keepalive(&self) -> bool {
        get_elapsed_time(self.last_sent).num_seconds() >= i64::from(self.interval)
    }

    /// Expiry is strictly past the hold time, at one-second granularity
    fn is_expired(&self) -> bool {
        get_elapsed_time(self.last_received).num_seconds() > i64::from(self.hold_time)
    }

    /// Bump the last received to now
    pub fn received(&mut self) {
        self.last_received = Utc::now();
    }

    /// Bump the last sent to now
    pub fn sent(&mut self) {
        self.last_sent = Utc::now();
    }

    /// Track KEEPALIVEs on a zero-hold session: the first is tolerated,
    /// a second one is an unacceptable hold time fault
    pub fn keepalive_received(&mut self) -> Result<(), SessionError> {
        if self.hold_time != 0 {
            return Ok(());
        }
        if self.zero_hold_seen {
            return Err(SessionError::Notify(Notification::with_message(
                2,
                6,
                "keepalive received on a zero hold-time session",
            )));
        }
        self.zero_hold_seen = true;
        Ok(())
    }

    // Remaining hold time, counting down to 0
    fn get_hold_time(&self) -> Duration {
        let hold_time = Duration::seconds(i64::from(self.hold_time));
        if get_elapsed_time(self.last_received) > hold_time {
            Duration::seconds(0)
        } else {
            hold_time - get_elapsed_time(self.last_received)
        }
    }
}

impl fmt::Display for HoldTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format_elapsed_time(self.get_hold_time()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(ht: &mut HoldTimer) {
        ht.timer = interval(time::Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_keepalive_due_after_a_third_of_hold_time() {
        let mut ht = HoldTimer::new(30);
        assert_eq!(ht.interval, 10);
        assert!(!ht.is_expired());

        ht.last_sent = ht.last_sent - Duration::seconds(5);
        fast(&mut ht);
        assert!(!ht.should_send_keepalive().await.unwrap());

        // At exactly a third of the hold time a keepalive is due
        ht.last_sent = ht.last_sent - Duration::seconds(5);
        fast(&mut ht);
        assert!(ht.should_send_keepalive().await.unwrap());

        ht.sent();
        fast(&mut ht);
        assert!(!ht.should_send_keepalive().await.unwrap());
    }

    #[tokio::test]
    async fn test_expiry_is_strictly_past_hold_time() {
        let mut ht = HoldTimer::new(30);
        // At exactly the hold time nothing happens
        ht.last_received = ht.last_received - Duration::seconds(30);
        fast(&mut ht);
        assert!(ht.should_send_keepalive().await.is_ok());

        // One second past it the session is dead
        ht.last_received = ht.last_received - Duration::seconds(1);
        fast(&mut ht);
        match ht.should_send_keepalive().await {
            Err(SessionError::HoldTimeExpired(30)) => {}
            other => panic!("expected hold-timer expiry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_hold_time_never_fires() {
        let mut ht = HoldTimer::new(0);
        ht.last_received = ht.last_received - Duration::seconds(3600);
        ht.last_sent = ht.last_sent - Duration::seconds(3600);
        fast(&mut ht);
        assert!(!ht.should_send_keepalive().await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_hold_time_second_keepalive_is_fatal() {
        let mut ht = HoldTimer::new(0);
        ht.keepalive_received().unwrap();
        match ht.keepalive_received() {
            Err(SessionError::Notify(n)) => assert_eq!((n.code, n.subcode), (2, 6)),
            other => panic!("expected unacceptable hold time, got {:?}", other),
        }

        // With a non-zero hold time keepalives are unremarkable
        let mut ht = HoldTimer::new(30);
        ht.keepalive_received().unwrap();
        ht.keepalive_received().unwrap();
    }
}
