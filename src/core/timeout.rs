//! Per-request timeouts.

use std::fmt::Debug;
use std::time::Duration;

use crate::common::Contact;

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds

/// Decides how long to wait for a response from a contact.
pub trait TimeoutStrategy: Send + Sync + Debug {
    /// Timeout for a request to `contact`, or to an address with no known contact.
    fn timeout(&self, contact: Option<&Contact>) -> Duration;
}

/// The same timeout for every request.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeout(pub Duration);

impl Default for FixedTimeout {
    fn default() -> Self {
        FixedTimeout(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl TimeoutStrategy for FixedTimeout {
    fn timeout(&self, _contact: Option<&Contact>) -> Duration {
        self.0
    }
}

/// A multiple of the contact's last observed round trip time, clamped to `[min, max]`.
///
/// Contacts with no known round trip time get `max`.
#[derive(Debug, Clone, Copy)]
pub struct RttTimeout {
    pub multiplier: u32,
    pub min: Duration,
    pub max: Duration,
}

impl Default for RttTimeout {
    fn default() -> Self {
        RttTimeout {
            multiplier: 4,
            min: Duration::from_millis(250),
            max: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl TimeoutStrategy for RttTimeout {
    fn timeout(&self, contact: Option<&Contact>) -> Duration {
        match contact.and_then(|contact| contact.round_trip_time()) {
            Some(rtt) => rtt
                .saturating_mul(self.multiplier)
                .clamp(self.min, self.max.max(self.min)),
            None => self.max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Id;

    #[test]
    fn rtt_timeout_is_clamped() {
        let strategy = RttTimeout::default();
        let address = "10.0.0.1:1".parse().unwrap();

        let fast = Contact::solicited(Id::random(), address, Duration::from_millis(10));
        let medium = Contact::solicited(Id::random(), address, Duration::from_millis(100));
        let slow = Contact::solicited(Id::random(), address, Duration::from_secs(5));
        let unknown = Contact::unknown(Id::random(), address);

        assert_eq!(strategy.timeout(Some(&fast)), strategy.min);
        assert_eq!(strategy.timeout(Some(&medium)), Duration::from_millis(400));
        assert_eq!(strategy.timeout(Some(&slow)), strategy.max);
        assert_eq!(strategy.timeout(Some(&unknown)), strategy.max);
        assert_eq!(strategy.timeout(None), strategy.max);
    }
}
