// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
// SPDX-License-Identifier: MPL-2.0

//! Circuit breaker over sandbox provisioning.
//!
//! After `threshold` consecutive isolation failures no sandbox is provisioned
//! until `cooldown` has elapsed. Then a single probe is let through: its
//! success closes the breaker, its failure opens it again. There is no way to
//! bypass an open breaker.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Provisioning is allowed
    Closed,
    /// Provisioning is refused until the cool-down elapses
    Open,
    /// Cool-down elapsed, one probe may provision
    HalfOpen,
}

#[derive(Debug, Default)]
struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probing: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.opened_at {
            None => BreakerState::Closed,
            Some(at) if at.elapsed() < self.cooldown => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
        }
    }

    /// True while new requests must be turned away. A half-open breaker
    /// admits requests so that one of them can probe.
    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Ask to provision a sandbox. Every `true` must be followed by a call to
    /// `record_success` or `record_failure`.
    pub fn allow_provisioning(&self) -> bool {
        let mut inner = self.lock();
        match inner.opened_at {
            None => true,
            Some(at) if at.elapsed() < self.cooldown => false,
            Some(_) if inner.probing => false,
            Some(_) => {
                info!("Circuit breaker half-open, letting one probe through");
                inner.probing = true;
                true
            }
        }
    }

    /// An isolation failure: provisioning or supervising a sandbox failed.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if inner.probing {
            inner.probing = false;
            inner.opened_at = Some(Instant::now());
            warn!("Circuit breaker probe failed, open again for {:?}", self.cooldown);
        } else if inner.opened_at.is_none() && inner.consecutive_failures >= self.threshold {
            inner.opened_at = Some(Instant::now());
            error!(
                "Circuit breaker open after {} consecutive isolation failures, refusing executions for {:?}",
                inner.consecutive_failures, self.cooldown
            );
        }
    }

    /// A sandbox was provisioned. Only the half-open probe may close an open
    /// breaker: a provisioning that started before the breaker opened says
    /// nothing about the cool-down.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.opened_at.is_some() {
            if !inner.probing {
                debug!("Ignoring a success from before the circuit breaker opened");
                return;
            }
            info!("Circuit breaker closed");
        }
        *inner = Inner::default();
    }

    /// A provisioning let through by `allow_provisioning` ended with neither
    /// success nor failure. Frees the probe slot of a half-open breaker.
    pub fn abandon(&self) {
        let mut inner = self.lock();
        if inner.probing {
            debug!("Circuit breaker probe abandoned");
            inner.probing = false;
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }
}
