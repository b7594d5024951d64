//! Runtime tunables. The binaries build a `Params` from CLI flags and an
//! optional JSON config file; the drivers and workers read it everywhere.

use crate::msg::VECTOR_IOVS_MAX;
use crate::support::CancelToken;
use crate::terminal::DEFAULT_ROUNDS;
use serde_derive::Deserialize;

/// Inclusive CPU range workers are associated with.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
pub struct CpuRange {
    pub first: u32,
    pub last: u32,
}

impl Default for CpuRange {
    fn default() -> CpuRange {
        CpuRange {
            first: 0,
            last: u32::max_value(),
        }
    }
}

#[derive(Clone)]
pub struct Params {
    /// Number of parallel sessions.
    pub nsessions: usize,
    /// Force contiguous RMA: at most one remote segment per write.
    pub contiguous: bool,
    /// Late registration: register payload buffers per transfer instead of
    /// in bulk at pool creation.
    pub reregister: bool,
    /// Use wait objects for worker readiness instead of pure polling.
    pub waitfd: bool,
    /// Expected cancellation state at exit; a mismatch fails the run.
    pub expect_cancellation: bool,
    pub processors: CpuRange,
    /// Payload length in repetitions of the reference text.
    pub rounds: usize,
    pub cancel: CancelToken,
}

impl Params {
    pub fn new() -> Params {
        Params {
            nsessions: 1,
            contiguous: false,
            reregister: false,
            waitfd: false,
            expect_cancellation: false,
            processors: CpuRange::default(),
            rounds: DEFAULT_ROUNDS,
            cancel: CancelToken::new(),
        }
    }

    /// Folds file-borne settings in; explicit CLI flags are applied on top
    /// by the caller.
    pub fn apply(&mut self, config: &Config) {
        if let Some(n) = config.nsessions {
            self.nsessions = n;
        }
        if let Some(v) = config.contiguous {
            self.contiguous = v;
        }
        if let Some(v) = config.reregister {
            self.reregister = v;
        }
        if let Some(v) = config.waitfd {
            self.waitfd = v;
        }
        if let Some(v) = config.expect_cancellation {
            self.expect_cancellation = v;
        }
        if let Some(p) = config.processors {
            self.processors = p;
        }
        if let Some(r) = config.rounds {
            self.rounds = r;
        }
    }

    /// Remote segments allowed in a single write.
    #[inline]
    pub fn rma_maxsegs(&self) -> usize {
        if self.contiguous {
            1
        } else {
            VECTOR_IOVS_MAX
        }
    }

    /// Segments per registration call; kept at one, the portable lower
    /// bound across providers.
    #[inline]
    pub fn mr_maxsegs(&self) -> usize {
        1
    }

    #[inline]
    pub fn rx_maxsegs(&self) -> usize {
        1
    }
}

/// File-loadable subset of `Params`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    pub nsessions: Option<usize>,
    pub contiguous: Option<bool>,
    pub reregister: Option<bool>,
    pub waitfd: Option<bool>,
    pub expect_cancellation: Option<bool>,
    pub processors: Option<CpuRange>,
    pub rounds: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_overlays_defaults() {
        let mut params = Params::new();
        let config = Config {
            nsessions: Some(8),
            contiguous: Some(true),
            rounds: Some(1000),
            ..Config::default()
        };

        params.apply(&config);

        assert_eq!(params.nsessions, 8);
        assert!(params.contiguous);
        assert_eq!(params.rounds, 1000);
        assert!(!params.reregister);
        assert_eq!(params.rma_maxsegs(), 1);
    }

    #[test]
    fn test_rma_segments_follow_contiguous_flag() {
        let mut params = Params::new();
        assert_eq!(params.rma_maxsegs(), VECTOR_IOVS_MAX);

        params.contiguous = true;
        assert_eq!(params.rma_maxsegs(), 1);
    }
}
