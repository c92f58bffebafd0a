//! Network-related configuration types

use std::num::NonZeroU16;
use std::str::FromStr;

use crate::types::ValidationError;

nonzero_newtype! {
    /// A network port number that cannot be zero
    ///
    /// # Examples
    /// ```
    /// use ojp_proxy::types::Port;
    ///
    /// let port = Port::new(1059).unwrap();
    /// assert_eq!(port.get(), 1059);
    /// assert!(Port::new(0).is_none());
    /// ```
    #[doc(alias = "tcp_port")]
    pub struct Port(NonZeroU16: u16, serialize as serialize_u16);
}

impl Port {
    /// Default proxy node listen port
    pub const DEFAULT: Self = Self(NonZeroU16::new(1059).unwrap());
}

impl Default for Port {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for Port {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u16>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| ValidationError::InvalidPort(s.to_string()))
    }
}

impl PartialOrd for Port {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Port {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.get().cmp(&other.get())
    }
}
