//! Construction parameters for [`ConcurrentReferenceHashMap`].
//!
//! Maps are configured either through [`Config`] directly or through the
//! chainable [`Builder`]. Both validate eagerly: an invalid load factor or a
//! zero concurrency level fails at construction, never later.
//!
//! [`ConcurrentReferenceHashMap`]: super::ConcurrentReferenceHashMap

use crate::{Error, Result};
use core::hash::{BuildHasher, Hash};
use fxhash::FxBuildHasher;

use super::ConcurrentReferenceHashMap;

/// Default initial capacity of a map
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;
/// Default load factor of every segment table
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;
/// Default number of concurrently writing threads the map is tuned for
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 16;
/// Largest number of segments a map will create
pub const MAXIMUM_CONCURRENCY_LEVEL: usize = 1 << 16;
/// Largest slot count a single segment table grows to
pub const MAXIMUM_SEGMENT_SIZE: usize = 1 << 30;

/// How eagerly an entry is reclaimed once its value is unreferenced elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReferenceKind {
    /// The map keeps its own strong handle to every value. Entries are only
    /// reclaimed by an explicit [`relieve_memory_pressure`] pass, which
    /// clears values that nothing outside the map still holds.
    ///
    /// [`relieve_memory_pressure`]: super::ConcurrentReferenceHashMap::relieve_memory_pressure
    #[default]
    Soft,
    /// The map holds values weakly. An entry is reclaimed as soon as the last
    /// [`Tracked`](super::Tracked) handle to its value is dropped.
    Weak,
}

/// Validated construction parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Number of entries the map should hold before any segment resizes
    pub initial_capacity: usize,
    /// Fraction of a segment table that may fill before it doubles
    pub load_factor: f32,
    /// Expected number of concurrently writing threads; rounded up to a
    /// power of two to size the segment array
    pub concurrency_level: usize,
    /// Reclamation aggressiveness shared by every segment
    pub reference_kind: ReferenceKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            reference_kind: ReferenceKind::default(),
        }
    }
}

impl Config {
    /// Check every parameter, returning the first violation
    ///
    /// # Examples
    ///
    /// ```rust
    /// use reclaim_map::{Config, Error};
    ///
    /// let config = Config { load_factor: 0.0, ..Config::default() };
    /// assert_eq!(config.validate(), Err(Error::InvalidLoadFactor(0.0)));
    /// ```
    pub fn validate(&self) -> Result<()> {
        if !(self.load_factor.is_finite() && self.load_factor > 0.0) {
            return Err(Error::InvalidLoadFactor(self.load_factor));
        }
        if self.concurrency_level == 0 {
            return Err(Error::InvalidConcurrencyLevel);
        }
        Ok(())
    }
}

/// Chainable constructor for [`ConcurrentReferenceHashMap`]
///
/// # Examples
///
/// ```rust
/// use reclaim_map::{Builder, ConcurrentReferenceHashMap, ReferenceKind};
///
/// let map: ConcurrentReferenceHashMap<String, u64> = Builder::new()
///     .initial_capacity(64)
///     .concurrency_level(4)
///     .reference_kind(ReferenceKind::Weak)
///     .build()?;
/// assert_eq!(map.segment_count(), 4);
/// # Ok::<(), reclaim_map::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct Builder<S = FxBuildHasher> {
    config: Config,
    hasher: S,
}

impl Builder {
    /// Start from the default configuration and hasher
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            hasher: FxBuildHasher::default(),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Builder<S> {
    /// Set the initial capacity
    pub fn initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.config.initial_capacity = initial_capacity;
        self
    }

    /// Set the load factor; must be positive and finite
    pub fn load_factor(mut self, load_factor: f32) -> Self {
        self.config.load_factor = load_factor;
        self
    }

    /// Set the concurrency level; must be non-zero
    pub fn concurrency_level(mut self, concurrency_level: usize) -> Self {
        self.config.concurrency_level = concurrency_level;
        self
    }

    /// Set the reclamation aggressiveness
    pub fn reference_kind(mut self, reference_kind: ReferenceKind) -> Self {
        self.config.reference_kind = reference_kind;
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a different key hasher
    pub fn hasher<S2>(self, hasher: S2) -> Builder<S2> {
        Builder {
            config: self.config,
            hasher,
        }
    }

    /// Validate the configuration and create the map
    pub fn build<K, V>(self) -> Result<ConcurrentReferenceHashMap<K, V, S>>
    where
        K: Hash + Eq,
        S: BuildHasher,
    {
        self.config.validate()?;
        Ok(ConcurrentReferenceHashMap::from_parts(self.config, self.hasher))
    }
}
