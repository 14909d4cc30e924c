/// Smallest number of entries a chunk is created with.
pub(crate) const MIN_CHUNK_ENTRIES: usize = 8;

/// Default upper bound on the byte size of a single chunk.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 4 << 20;

/// Default ratio of entries to buckets the table tolerates before growing
/// its bucket array.
pub const DEFAULT_MAX_LOAD_FACTOR: f32 = 1.0;

const MIN_LOAD_FACTOR: f32 = 0.25;
const MAX_LOAD_FACTOR: f32 = 16.0;

/// Construction parameters for a table.
///
/// # Examples
///
/// ```rust
/// use chunk_dict::Config;
///
/// let config = Config::new()
///     .initial_capacity(1000)
///     .max_load_factor(2.0)
///     .max_chunk_bytes(1 << 20)
///     .auto_shrink(false);
/// assert_eq!(config.get_initial_capacity(), 1000);
/// assert_eq!(config.get_max_load_factor(), 2.0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    initial_capacity: usize,
    max_load_factor: f32,
    max_chunk_bytes: usize,
    auto_shrink: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Returns the default configuration.
    pub const fn new() -> Self {
        Self {
            initial_capacity: 0,
            max_load_factor: DEFAULT_MAX_LOAD_FACTOR,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            auto_shrink: true,
        }
    }

    /// Number of entries the first chunk holds. Rounded up to a power of two
    /// with a floor of eight entries.
    pub const fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Maximum average chain length. Non-finite values fall back to the
    /// default; finite values are clamped to `[0.25, 16.0]`.
    pub fn max_load_factor(mut self, factor: f32) -> Self {
        self.max_load_factor = if factor.is_finite() {
            factor.clamp(MIN_LOAD_FACTOR, MAX_LOAD_FACTOR)
        } else {
            DEFAULT_MAX_LOAD_FACTOR
        };
        self
    }

    /// Upper bound on the byte size of one chunk. A chunk always holds at
    /// least one entry.
    pub const fn max_chunk_bytes(mut self, bytes: usize) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    /// Whether erasing down to an eighth of the entry capacity triggers an
    /// automatic [`rearrange`](crate::HashTable::rearrange).
    pub const fn auto_shrink(mut self, enabled: bool) -> Self {
        self.auto_shrink = enabled;
        self
    }

    /// Returns the configured initial capacity.
    pub const fn get_initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    /// Returns the configured maximum load factor.
    pub const fn get_max_load_factor(&self) -> f32 {
        self.max_load_factor
    }

    /// Returns the configured chunk byte budget.
    pub const fn get_max_chunk_bytes(&self) -> usize {
        self.max_chunk_bytes
    }

    /// Returns whether automatic compaction on erase is enabled.
    pub const fn get_auto_shrink(&self) -> bool {
        self.auto_shrink
    }

    /// Entries in the first chunk, before the chunk byte cap is applied.
    pub(crate) fn initial_chunk_entries(&self) -> usize {
        self.initial_capacity
            .max(MIN_CHUNK_ENTRIES)
            .checked_next_power_of_two()
            .unwrap_or(usize::MAX)
    }

    /// Number of buckets needed to hold `entries` without exceeding the
    /// maximum load factor.
    pub(crate) fn buckets_for(&self, entries: usize) -> usize {
        // Rounds up by hand: `f64::ceil` needs std. The cast saturates.
        let wanted = entries as f64 / self.max_load_factor as f64;
        let whole = wanted as usize;
        if (whole as f64) < wanted {
            whole.saturating_add(1)
        } else {
            whole
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_factor_is_clamped() {
        assert_eq!(Config::new().max_load_factor(0.0).get_max_load_factor(), 0.25);
        assert_eq!(Config::new().max_load_factor(100.0).get_max_load_factor(), 16.0);
        assert_eq!(
            Config::new().max_load_factor(f32::NAN).get_max_load_factor(),
            DEFAULT_MAX_LOAD_FACTOR
        );
    }

    #[test]
    fn initial_chunk_is_power_of_two_with_floor() {
        assert_eq!(Config::new().initial_chunk_entries(), 8);
        assert_eq!(Config::new().initial_capacity(3).initial_chunk_entries(), 8);
        assert_eq!(Config::new().initial_capacity(9).initial_chunk_entries(), 16);
        assert_eq!(Config::new().initial_capacity(1000).initial_chunk_entries(), 1024);
    }

    #[test]
    fn buckets_for_respects_load_factor() {
        assert_eq!(Config::new().buckets_for(100), 100);
        assert_eq!(Config::new().max_load_factor(2.0).buckets_for(100), 50);
        assert_eq!(Config::new().max_load_factor(0.5).buckets_for(100), 200);
    }

    #[test]
    fn buckets_for_rounds_up_and_saturates() {
        assert_eq!(Config::new().max_load_factor(2.0).buckets_for(3), 2);
        assert_eq!(Config::new().max_load_factor(1.5).buckets_for(100), 67);
        assert_eq!(Config::new().buckets_for(0), 0);
        assert_eq!(Config::new().max_load_factor(0.25).buckets_for(usize::MAX), usize::MAX);
    }
}
