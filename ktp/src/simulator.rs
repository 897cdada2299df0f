//! Channel-loss emulation for the inbound path.
//!
//! Loopback UDP practically never loses datagrams.  To exercise the
//! retransmission machinery, the inbound engine consults a [`LossModel`] for
//! every datagram it receives and silently discards the ones it is told to
//! drop: no ACK, no state change, no error.
//!
//! The stock model is [`LossSimulator`], an independent Bernoulli gate with
//! probability `P`.  Tests plug in their own [`LossModel`] to drop specific
//! segments deterministically.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ConfigError;
use crate::segment::Segment;

/// Decides whether a received segment is lost.
pub trait LossModel: Send {
    /// `true` to discard `segment` as if the channel had lost it.
    fn should_drop(&mut self, segment: &Segment) -> bool;
}

/// Drops each segment independently with a fixed probability.
#[derive(Debug)]
pub struct LossSimulator {
    probability: f64,
    rng: StdRng,
}

impl LossSimulator {
    /// `seed` makes the drop pattern reproducible; `None` seeds from the OS.
    ///
    /// Rejects a `probability` outside `[0, 1]`, NaN included.
    pub fn new(probability: f64, seed: Option<u64>) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(ConfigError::LossProbability(probability));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self { probability, rng })
    }
}

impl LossModel for LossSimulator {
    fn should_drop(&mut self, _segment: &Segment) -> bool {
        self.rng.random_bool(self.probability)
    }
}
