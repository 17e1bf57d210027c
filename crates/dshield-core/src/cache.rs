//! The seed key cache: one envelope per `(root key, target SD, L0)` slot,
//! advanced monotonically along the ratchet, plus locally loaded root keys
//! that let lookups synthesise seeds without a server round-trip.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use twox_hash::XxHash64;
use uuid::Uuid;

use crate::error::Result;
use crate::gkdi::{compute_l1_key, compute_l2_key, GroupKeyEnvelope, RootKey, MAX_INDEX};

/// 1970-01-01 as a FILETIME tick count.
pub const FILETIME_EPOCH: u64 = 116_444_736_000_000_000;
/// One L2 interval: 10 hours in 100ns FILETIME ticks.
const KDS_KEY_CYCLE: u64 = 360_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SeedSlot {
    root_key_id: Uuid,
    target_sd: u64,
    l0: i32,
}

impl SeedSlot {
    fn new(root_key_id: Uuid, target_sd: &[u8], l0: i32) -> Self {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(target_sd);
        Self {
            root_key_id,
            target_sd: hasher.finish(),
            l0,
        }
    }
}

/// Shared cache of GKDI material.
///
/// Safe to share across threads; stores are serialised behind a write lock
/// and never move a slot backwards along the `(L1, L2)` ratchet.
#[derive(Debug, Default)]
pub struct KeyCache {
    root_keys: RwLock<HashMap<Uuid, RootKey>>,
    seed_keys: RwLock<HashMap<SeedSlot, GroupKeyEnvelope>>,
    flights: Mutex<HashMap<SeedSlot, Arc<AsyncMutex<()>>>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a KDS root key so later lookups can derive seeds locally.
    ///
    /// The key material is the `msKds-RootKeyData` attribute of the
    /// `msKds-ProvRootKey` object named by `root_key_id`; see
    /// [`RootKey::new`] for the metadata defaults.
    pub fn load_key(&self, root_key_id: Uuid, root_key: RootKey) {
        debug!(%root_key_id, "loaded root key");
        self.root_keys
            .write()
            .expect("cache lock poisoned")
            .insert(root_key_id, root_key);
    }

    /// Look up a seed that dominates `(l1, l2)` for the slot.
    ///
    /// On a miss with a loaded root key, a fresh L1 = L2 = 31 envelope is
    /// derived, stored and returned. `None` means the caller has to ask a
    /// domain controller.
    pub fn get(
        &self,
        target_sd: &[u8],
        root_key_id: Uuid,
        l0: i32,
        l1: i32,
        l2: i32,
    ) -> Result<Option<GroupKeyEnvelope>> {
        let slot = SeedSlot::new(root_key_id, target_sd, l0);
        if let Some(seed) = self
            .seed_keys
            .read()
            .expect("cache lock poisoned")
            .get(&slot)
        {
            if seed.l1 > l1 || (seed.l1 == l1 && seed.l2 >= l2) {
                debug!(%root_key_id, l0, l1, l2, "seed cache hit");
                return Ok(Some(seed.clone()));
            }
        }

        let root_key = self
            .root_keys
            .read()
            .expect("cache lock poisoned")
            .get(&root_key_id)
            .cloned();
        let Some(root_key) = root_key else {
            return Ok(None);
        };

        let alg = root_key.hash_algorithm()?;
        let l1_seed = compute_l1_key(target_sd, root_key_id, l0, &root_key.key, alg);
        let envelope = GroupKeyEnvelope {
            version: root_key.version,
            flags: 2,
            l0,
            l1: MAX_INDEX,
            l2: MAX_INDEX,
            root_key_id,
            kdf_algorithm: root_key.kdf_algorithm.clone(),
            kdf_parameters: root_key.kdf_parameters.clone(),
            secret_algorithm: root_key.secret_algorithm.clone(),
            secret_parameters: root_key.secret_parameters.clone(),
            private_key_length: root_key.private_key_length,
            public_key_length: root_key.public_key_length,
            domain_name: String::new(),
            forest_name: String::new(),
            l1_key: l1_seed,
            l2_key: Vec::new(),
        };
        debug!(%root_key_id, l0, "synthesised seed from loaded root key");
        self.store(target_sd, &envelope);
        Ok(Some(envelope))
    }

    /// Store an envelope if it advances its slot.
    ///
    /// Public-key envelopes are one-shot and never cached; an envelope that
    /// does not strictly exceed the stored `(L1, L2)` is dropped. Returns
    /// whether the slot changed.
    pub fn store(&self, target_sd: &[u8], key: &GroupKeyEnvelope) -> bool {
        if key.is_public_key() {
            debug!(root_key_id = %key.root_key_id, "not caching one-shot public key envelope");
            return false;
        }
        let slot = SeedSlot::new(key.root_key_id, target_sd, key.l0);
        let mut seeds = self.seed_keys.write().expect("cache lock poisoned");
        match seeds.get(&slot) {
            Some(existing)
                if !(key.l1 > existing.l1 || (key.l1 == existing.l1 && key.l2 > existing.l2)) =>
            {
                debug!(root_key_id = %key.root_key_id, l0 = key.l0, "store does not advance slot");
                false
            }
            _ => {
                debug!(
                    root_key_id = %key.root_key_id,
                    l0 = key.l0,
                    l1 = key.l1,
                    l2 = key.l2,
                    "stored seed envelope"
                );
                seeds.insert(slot, key.clone());
                true
            }
        }
    }

    /// The single-flight lock for a slot. Callers hold it across a `GetKey`
    /// round-trip and re-probe the cache once acquired, so concurrent
    /// requests for one slot collapse to a single RPC.
    pub fn flight(&self, target_sd: &[u8], root_key_id: Uuid, l0: i32) -> Arc<AsyncMutex<()>> {
        let slot = SeedSlot::new(root_key_id, target_sd, l0);
        self.flights
            .lock()
            .expect("cache lock poisoned")
            .entry(slot)
            .or_default()
            .clone()
    }

    /// The `(L0, L1, L2)` interval covering the current wall clock, per the
    /// MS-GKDI group key identifier rules.
    pub fn current_interval() -> (i32, i32, i32) {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before 1970");
        let filetime = unix.as_nanos() as u64 / 100 + FILETIME_EPOCH;
        interval_indices(filetime)
    }

    /// Probe for a seed usable to protect new content right now.
    ///
    /// Requires the caller to have pinned a root key id; the returned
    /// envelope carries the current interval's L2 key and nothing else.
    pub fn protection_seed(
        &self,
        root_key_id: Option<Uuid>,
        target_sd: &[u8],
    ) -> Result<Option<GroupKeyEnvelope>> {
        let Some(root_key_id) = root_key_id else {
            return Ok(None);
        };
        let (l0, l1, l2) = Self::current_interval();
        let Some(seed) = self.get(target_sd, root_key_id, l0, l1, l2)? else {
            return Ok(None);
        };

        let alg = seed.hash_algorithm()?;
        let l2_key = compute_l2_key(alg, target_sd, l1, l2, &seed)?;
        Ok(Some(GroupKeyEnvelope {
            version: seed.version,
            flags: seed.flags,
            l0,
            l1,
            l2,
            root_key_id,
            kdf_algorithm: seed.kdf_algorithm.clone(),
            kdf_parameters: seed.kdf_parameters.clone(),
            secret_algorithm: seed.secret_algorithm.clone(),
            secret_parameters: seed.secret_parameters.clone(),
            private_key_length: seed.private_key_length,
            public_key_length: seed.public_key_length,
            domain_name: seed.domain_name.clone(),
            forest_name: seed.forest_name.clone(),
            l1_key: Vec::new(),
            l2_key,
        }))
    }
}

fn interval_indices(filetime: u64) -> (i32, i32, i32) {
    let l0 = filetime / (32 * 32 * KDS_KEY_CYCLE);
    let l1 = (filetime % (32 * 32 * KDS_KEY_CYCLE)) / (32 * KDS_KEY_CYCLE);
    let l2 = (filetime % (32 * KDS_KEY_CYCLE)) / KDS_KEY_CYCLE;
    (l0 as i32, l1 as i32, l2 as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_for_unix_epoch() {
        assert_eq!(interval_indices(FILETIME_EPOCH), (315, 28, 1));
    }

    #[test]
    fn interval_advances_with_the_clock() {
        let (l0, l1, l2) = interval_indices(FILETIME_EPOCH);
        let next = interval_indices(FILETIME_EPOCH + KDS_KEY_CYCLE);
        assert_eq!(next, (l0, l1, l2 + 1));
    }
}
