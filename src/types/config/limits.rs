//! Connection and error limit configuration types

use std::num::{NonZeroU32, NonZeroUsize};

nonzero_newtype! {
    /// A non-zero pool size
    ///
    /// # Examples
    /// ```
    /// use ojp_proxy::types::MaxConnections;
    ///
    /// let max = MaxConnections::new(20).unwrap();
    /// assert_eq!(max.get(), 20);
    /// assert!(MaxConnections::new(0).is_none());
    /// ```
    #[doc(alias = "pool_size")]
    pub struct MaxConnections(NonZeroUsize: usize, serialize as serialize_u64);
}

impl MaxConnections {
    /// Default maximum backend connections per target
    pub const DEFAULT: Self = Self(NonZeroUsize::new(20).unwrap());
}

nonzero_newtype! {
    /// A non-zero count of consecutive errors before acting on a target
    ///
    /// Used as the circuit breaker trip threshold.
    pub struct MaxErrors(NonZeroU32: u32, serialize as serialize_u32);
}

impl MaxErrors {
    /// Default consecutive failure threshold
    pub const DEFAULT: Self = Self(NonZeroU32::new(3).unwrap());
}
