/// Warren timestamp.
///
/// Internally i64 milliseconds from unix epoch. Cooldown wakeups are
/// absolute wall-clock millisecond values, and zero is the "not in
/// cooldown" sentinel, so milliseconds (not micros) are the unit
/// throughout.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The zero timestamp. Used as the "not in cooldown" sentinel.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Construct a new timestamp of "now".
    pub fn now() -> Self {
        std::time::SystemTime::now().into()
    }

    /// Construct a timestamp from i64 milliseconds since unix epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Get the i64 milliseconds since unix epoch.
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// The larger of two timestamps.
    pub fn max(self, other: Timestamp) -> Timestamp {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }
}

impl std::ops::Add<std::time::Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: std::time::Duration) -> Self::Output {
        Timestamp(self.0 + rhs.as_millis() as i64)
    }
}

impl std::ops::AddAssign<std::time::Duration> for Timestamp {
    fn add_assign(&mut self, rhs: std::time::Duration) {
        self.0 += rhs.as_millis() as i64;
    }
}

impl std::ops::Sub for Timestamp {
    type Output = std::time::Duration;

    /// Saturating difference: an earlier minus a later timestamp is
    /// zero.
    fn sub(self, rhs: Self) -> Self::Output {
        if self.0 < rhs.0 {
            std::time::Duration::ZERO
        } else {
            std::time::Duration::from_millis((self.0 - rhs.0) as u64)
        }
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(t: std::time::SystemTime) -> Self {
        Self(
            t.duration_since(std::time::SystemTime::UNIX_EPOCH)
                .expect("invalid system time")
                .as_millis() as i64,
        )
    }
}

impl From<Timestamp> for std::time::SystemTime {
    fn from(t: Timestamp) -> Self {
        std::time::SystemTime::UNIX_EPOCH
            + std::time::Duration::from_millis(t.0 as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_duration() {
        let t = Timestamp::from_millis(1_000);
        assert_eq!(
            Timestamp::from_millis(1_500),
            t + std::time::Duration::from_millis(500),
        );
    }

    #[test]
    fn sub_saturates() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(2_000);
        assert_eq!(std::time::Duration::ZERO, a - b);
        assert_eq!(std::time::Duration::from_secs(1), b - a);
    }

    #[test]
    fn max_picks_later() {
        let a = Timestamp::from_millis(5);
        let b = Timestamp::from_millis(9);
        assert_eq!(b, a.max(b));
        assert_eq!(b, b.max(a));
    }
}
