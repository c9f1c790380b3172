// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Isolation ids for concurrent runs.
//!
//! Every run leases an id from a configured range and passes it to its workers and subscribers
//! through an environment variable (by default `ROS_DOMAIN_ID`). Two runs holding different ids
//! never observe each other's traffic.
//!
//! Leases are unique within a process through an in-use set shared by every allocator for the same
//! variable, and across processes by holding a TCP listener bound to
//! `127.0.0.1:(lock_port_base + id)` for the lifetime of the lease. Processes sharing a variable
//! must agree on `lock_port_base`.

use crate::errors::IsolationError;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    net::{Ipv4Addr, TcpListener},
    ops::RangeInclusive,
    sync::{
        Arc, LazyLock, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};
use tracing::debug;

/// The default environment variable carrying the isolation id.
pub const DEFAULT_ISOLATION_ENV_VAR: &str = "ROS_DOMAIN_ID";

/// An isolation id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IsolationId(u32);

impl IsolationId {
    /// Creates a new isolation id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the id as an integer.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for IsolationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The environment pair passed to workers and subscribers of a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IsolationEnv {
    var: String,
    id: IsolationId,
}

impl IsolationEnv {
    /// Creates a new `IsolationEnv`.
    pub fn new(var: impl Into<String>, id: IsolationId) -> Self {
        Self {
            var: var.into(),
            id,
        }
    }

    /// Returns the environment variable name.
    pub fn var(&self) -> &str {
        &self.var
    }

    /// Returns the isolation id.
    pub fn id(&self) -> IsolationId {
        self.id
    }

    /// Sets the isolation variable on a command.
    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        cmd.env(&self.var, self.id.to_string());
    }
}

/// Isolation settings for a suite.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IsolationSettings {
    env_var: String,
    id_range: RangeInclusive<u32>,
    lock_port_base: u16,
}

impl IsolationSettings {
    /// Creates new isolation settings.
    pub fn new(env_var: impl Into<String>, id_range: RangeInclusive<u32>, lock_port_base: u16) -> Self {
        Self {
            env_var: env_var.into(),
            id_range,
            lock_port_base,
        }
    }

    /// Returns the environment variable name.
    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    /// Returns the inclusive range of ids.
    pub fn id_range(&self) -> &RangeInclusive<u32> {
        &self.id_range
    }

    /// Returns the first port used for cross-process locking.
    pub fn lock_port_base(&self) -> u16 {
        self.lock_port_base
    }
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self::new(DEFAULT_ISOLATION_ENV_VAR, 1..=101, 22119)
    }
}

type InUseSet = Arc<Mutex<BTreeSet<u32>>>;

// Ids leased in this process, per environment variable.
static IN_USE: LazyLock<Mutex<HashMap<String, InUseSet>>> = LazyLock::new(Default::default);

fn in_use_for(env_var: &str) -> InUseSet {
    IN_USE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(env_var.to_owned())
        .or_default()
        .clone()
}

/// Hands out isolation ids.
///
/// All allocators for the same environment variable share one in-use set, whatever their other
/// settings.
#[derive(Clone, Debug)]
pub struct IsolationAllocator {
    settings: IsolationSettings,
    in_use: InUseSet,
    counter: Arc<AtomicU32>,
}

impl IsolationAllocator {
    /// Creates a new allocator for the given settings.
    pub fn new(settings: IsolationSettings) -> Self {
        let in_use = in_use_for(&settings.env_var);
        Self {
            settings,
            in_use,
            counter: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Returns the settings this allocator leases from.
    pub fn settings(&self) -> &IsolationSettings {
        &self.settings
    }

    /// Leases a fresh isolation id.
    pub fn lease(&self) -> Result<IsolationLease, IsolationError> {
        let start = *self.settings.id_range.start();
        let end = *self.settings.id_range.end();
        let exhausted = IsolationError::Exhausted { start, end };
        if start > end {
            return Err(exhausted);
        }

        // Spread concurrent processes over the range so they rarely contend for the same id.
        let len = u64::from(end - start) + 1;
        let offset = (u64::from(std::process::id())
            + u64::from(self.counter.fetch_add(1, Ordering::Relaxed)))
            % len;

        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        for step in 0..len {
            // Both summands are below len, which fits in u32 + 1.
            let id = start + ((offset + step) % len) as u32;
            if in_use.contains(&id) {
                continue;
            }
            let Some(listener) = self.try_lock_port(id) else {
                continue;
            };
            in_use.insert(id);
            debug!(id, "leased isolation id");
            return Ok(IsolationLease {
                env: IsolationEnv::new(self.settings.env_var.clone(), IsolationId(id)),
                lock: Some(LeaseLock {
                    id,
                    in_use: self.in_use.clone(),
                    _listener: listener,
                }),
            });
        }

        Err(exhausted)
    }

    /// Uses an id inherited from the launching environment, given the current value of the
    /// isolation variable.
    ///
    /// The id is used verbatim: the caller is responsible for its uniqueness.
    pub fn inherit(&self, value: Option<&str>) -> Result<IsolationLease, IsolationError> {
        let var = &self.settings.env_var;
        let value = value.ok_or_else(|| IsolationError::InheritedMissing { var: var.clone() })?;
        let id = value
            .trim()
            .parse::<u32>()
            .map_err(|_| IsolationError::InheritedInvalid {
                var: var.clone(),
                value: value.to_owned(),
            })?;
        debug!(id, "inherited isolation id");
        Ok(IsolationLease {
            env: IsolationEnv::new(var.clone(), IsolationId(id)),
            lock: None,
        })
    }

    fn try_lock_port(&self, id: u32) -> Option<TcpListener> {
        let port = u32::from(self.settings.lock_port_base)
            .checked_add(id)
            .and_then(|port| u16::try_from(port).ok())?;
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => Some(listener),
            Err(error) => {
                debug!(id, port, %error, "isolation id is held by another process");
                None
            }
        }
    }
}

/// A leased isolation id. Dropping the lease releases the id.
#[derive(Debug)]
pub struct IsolationLease {
    env: IsolationEnv,
    lock: Option<LeaseLock>,
}

impl IsolationLease {
    /// Returns the environment pair for this lease.
    pub fn env(&self) -> &IsolationEnv {
        &self.env
    }

    /// Returns the leased id.
    pub fn id(&self) -> IsolationId {
        self.env.id
    }

    /// Returns true if the id was inherited rather than leased.
    pub fn is_inherited(&self) -> bool {
        self.lock.is_none()
    }
}

#[derive(Debug)]
struct LeaseLock {
    id: u32,
    in_use: InUseSet,
    _listener: TcpListener,
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        debug!(id = self.id, "released isolation id");
    }
}
