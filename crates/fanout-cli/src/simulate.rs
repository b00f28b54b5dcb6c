//! In-process simulated endpoint.
//!
//! [`SimulatedTransport`] stands in for a real endpoint when trying out
//! admission and retry settings: every call waits for a configured latency
//! and then fails with a configured probability per failure class. Rolls
//! come from a seeded generator, so a given seed and call order always
//! produce the same sequence of results.

use async_trait::async_trait;
use bytes::Bytes;
use fanout_common::{FanoutError, InvocationError, InvokeResult, Record, Result, Transport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Failure rates and latency of the simulated endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationProfile {
    /// Percentage of calls answered with a throttling response
    pub throttle_pct: u8,
    /// Percentage of calls failing transiently
    pub transient_pct: u8,
    /// Percentage of calls rejected permanently
    pub fatal_pct: u8,
    pub latency: Duration,
    pub seed: u64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            throttle_pct: 5,
            transient_pct: 5,
            fatal_pct: 1,
            latency: Duration::from_millis(20),
            seed: 0,
        }
    }
}

impl SimulationProfile {
    /// Rejects percentages that add up to more than 100.
    pub fn validate(&self) -> Result<()> {
        let total =
            u32::from(self.throttle_pct) + u32::from(self.transient_pct) + u32::from(self.fatal_pct);
        if total > 100 {
            return Err(FanoutError::configuration(format!(
                "simulated failure percentages add up to {}%",
                total
            )));
        }
        Ok(())
    }
}

pub struct SimulatedTransport {
    profile: SimulationProfile,
    rng: Mutex<StdRng>,
}

impl SimulatedTransport {
    pub fn new(profile: SimulationProfile) -> Result<Self> {
        profile.validate()?;
        let rng = StdRng::seed_from_u64(profile.seed);
        Ok(Self {
            profile,
            rng: Mutex::new(rng),
        })
    }

    pub fn profile(&self) -> &SimulationProfile {
        &self.profile
    }

    fn roll(&self) -> u8 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..100)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn invoke(&self, record: &Record) -> InvokeResult {
        let roll = self.roll();
        if !self.profile.latency.is_zero() {
            tokio::time::sleep(self.profile.latency).await;
        }

        let throttled = self.profile.throttle_pct;
        let transient = throttled + self.profile.transient_pct;
        let fatal = transient + self.profile.fatal_pct;

        if roll < throttled {
            Err(InvocationError::throttled("simulated 429 Too Many Requests"))
        } else if roll < transient {
            Err(InvocationError::transient("simulated connection reset"))
        } else if roll < fatal {
            Err(InvocationError::fatal(format!(
                "simulated rejection of {}",
                record.id
            )))
        } else {
            Ok(Bytes::from_static(b"{\"accepted\":true}"))
        }
    }
}
