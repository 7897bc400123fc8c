//! Address pool with random allocation and lifetime-bounded reservations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv6Addr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("no more free ip addresses are currently available in the pool")]
    NoAddressesAvailable,
}

/// A lease of one address to one interface of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAssociation {
    pub ip_address: Ipv6Addr,
    pub client_id: Vec<u8>,
    pub interface_id: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// The outcome of a reservation call. Interfaces granted an address before
/// the pool ran dry are listed even when `failure` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub associations: Vec<IdentityAssociation>,
    pub failure: Option<PoolError>,
}

/// Tracks assigned and available addresses.
pub trait AddressPool: Send + Sync {
    /// Creates new or retrieves active associations for each interface id.
    /// Existing live associations are returned unchanged.
    fn reserve_addresses(&self, client_id: &[u8], interface_ids: &[Vec<u8>]) -> Reservation;

    /// Returns the addresses associated with the given interface ids to the
    /// pool. Unknown tuples are ignored.
    fn release_addresses(&self, client_id: &[u8], interface_ids: &[Vec<u8>]);
}

type AssociationKey = (Vec<u8>, Vec<u8>);

struct Expiration {
    expires_at: DateTime<Utc>,
    key: AssociationKey,
    ip_address: Ipv6Addr,
    created_at: DateTime<Utc>,
}

struct PoolState {
    associations: HashMap<AssociationKey, IdentityAssociation>,
    used: HashSet<u128>,
    // Valid because the lifetime is constant for the pool's whole life:
    // insertion order and expiration order coincide, so a plain queue
    // stands in for a priority queue.
    expirations: VecDeque<Expiration>,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Hands out random addresses from a contiguous range.
///
/// Expired associations are swept on every reservation, so no background
/// task is needed. All access is serialized by one mutex; nothing is held
/// across I/O.
pub struct RandomAddressPool {
    pool_start: u128,
    pool_size: u64,
    valid_lifetime: u32,
    state: Mutex<PoolState>,
    clock: Clock,
}

impl RandomAddressPool {
    /// `pool_start` is the first address of the range; `pool_size`
    /// addresses starting there are available; associations live for
    /// `valid_lifetime` seconds.
    pub fn new(pool_start: Ipv6Addr, pool_size: u64, valid_lifetime: u32) -> Self {
        RandomAddressPool {
            pool_start: u128::from(pool_start),
            pool_size,
            valid_lifetime,
            state: Mutex::new(PoolState {
                associations: HashMap::new(),
                used: HashSet::new(),
                expirations: VecDeque::new(),
            }),
            clock: Box::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_clock(&mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) {
        self.clock = Box::new(clock);
    }

    fn sweep(&self, state: &mut PoolState, now: DateTime<Utc>) {
        while state
            .expirations
            .front()
            .is_some_and(|head| head.expires_at <= now)
        {
            let Some(head) = state.expirations.pop_front() else {
                break;
            };
            // Only drop state that still belongs to this entry; a release
            // or re-reservation may already have recycled the address.
            if let Some(current) = state.associations.get(&head.key) {
                if current.created_at == head.created_at && current.ip_address == head.ip_address {
                    state.associations.remove(&head.key);
                    state.used.remove(&u128::from(head.ip_address));
                }
            }
        }
    }

    fn draw_address(&self, state: &PoolState, rng: &mut StdRng) -> Option<u128> {
        // Rejection sampling is O(1) until the pool fills up; past
        // half-full, scan from a random start instead.
        if (state.used.len() as u64) * 2 < self.pool_size {
            loop {
                let offset = rng.gen_range(0..self.pool_size);
                let candidate = self.pool_start + offset as u128;
                if !state.used.contains(&candidate) {
                    return Some(candidate);
                }
            }
        }
        let start = rng.gen_range(0..self.pool_size);
        for i in 0..self.pool_size {
            let candidate = self.pool_start + ((start + i) % self.pool_size) as u128;
            if !state.used.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

impl AddressPool for RandomAddressPool {
    fn reserve_addresses(&self, client_id: &[u8], interface_ids: &[Vec<u8>]) -> Reservation {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = (self.clock)();
        self.sweep(&mut state, now);

        let seed = (now.timestamp() as u64)
            .wrapping_mul(1_000_000_000)
            .wrapping_add(now.timestamp_subsec_nanos() as u64);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut associations = Vec::with_capacity(interface_ids.len());
        for interface_id in interface_ids {
            let key = (client_id.to_vec(), interface_id.clone());
            if let Some(existing) = state.associations.get(&key) {
                associations.push(existing.clone());
                continue;
            }
            if state.used.len() as u64 == self.pool_size {
                return Reservation {
                    associations,
                    failure: Some(PoolError::NoAddressesAvailable),
                };
            }
            let Some(addr) = self.draw_address(&state, &mut rng) else {
                return Reservation {
                    associations,
                    failure: Some(PoolError::NoAddressesAvailable),
                };
            };
            let association = IdentityAssociation {
                ip_address: Ipv6Addr::from(addr),
                client_id: client_id.to_vec(),
                interface_id: interface_id.clone(),
                created_at: now,
            };
            state.used.insert(addr);
            state.expirations.push_back(Expiration {
                expires_at: now + Duration::seconds(self.valid_lifetime as i64),
                key: key.clone(),
                ip_address: association.ip_address,
                created_at: now,
            });
            state.associations.insert(key, association.clone());
            associations.push(association);
        }

        Reservation {
            associations,
            failure: None,
        }
    }

    fn release_addresses(&self, client_id: &[u8], interface_ids: &[Vec<u8>]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for interface_id in interface_ids {
            let key = (client_id.to_vec(), interface_id.clone());
            if let Some(association) = state.associations.remove(&key) {
                state.used.remove(&u128::from(association.ip_address));
            }
        }
    }
}
