//! Profile directory and hosting agreements.
//!
//! Holds the profiles of identities hosted by this node and of identities
//! imported from neighbour nodes. Search works on a sorted snapshot so
//! matching never holds a map lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};
use waypost_types::error::{WaypostError, WaypostResult};
use waypost_types::identity::IdentityId;
use waypost_types::profile::{EncodedLocation, Profile, ProfileRecord};

/// How the directory knows an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostingStatus {
    /// Active hosting agreement with this node.
    Hosted,
    /// Hosting was cancelled, optionally naming where the identity went.
    Redirected(Option<IdentityId>),
    /// Profile learned from a neighbour node.
    Neighbor,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub public_key: Vec<u8>,
    pub profile: Profile,
    pub status: HostingStatus,
}

/// Changes to a hosted profile. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub location: Option<EncodedLocation>,
    pub extra_data: Option<String>,
    pub thumbnail: Option<Vec<u8>>,
}

/// Concurrent profile directory.
pub struct ProfileDirectory {
    entries: DashMap<IdentityId, DirectoryEntry>,
    hosted: AtomicUsize,
    max_hosted: usize,
}

impl ProfileDirectory {
    /// Create an empty directory hosting at most `max_hosted` identities.
    pub fn new(max_hosted: usize) -> Self {
        Self {
            entries: DashMap::new(),
            hosted: AtomicUsize::new(0),
            max_hosted,
        }
    }

    /// Number of identities currently hosted.
    pub fn hosted_count(&self) -> usize {
        self.hosted.load(Ordering::Relaxed)
    }

    /// Start hosting the identity owning `public_key`.
    pub fn register_hosting(&self, public_key: &[u8], identity_type: &str) -> WaypostResult<IdentityId> {
        let id = IdentityId::from_public_key(public_key);
        self.reserve_slot()?;

        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().status == HostingStatus::Hosted {
                    self.hosted.fetch_sub(1, Ordering::Relaxed);
                    return Err(WaypostError::AlreadyExists("hosting agreement".into()));
                }
                occupied.insert(new_hosted_entry(public_key, identity_type));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(new_hosted_entry(public_key, identity_type));
            }
        }
        info!(identity = %id, identity_type, "Hosting agreement registered");
        Ok(id)
    }

    fn reserve_slot(&self) -> WaypostResult<()> {
        self.hosted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_hosted).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| WaypostError::QuotaExceeded("hosted identities".into()))
    }

    /// Apply `update` to a hosted profile and bump its version.
    pub fn update_profile(&self, id: &IdentityId, update: ProfileUpdate) -> WaypostResult<Profile> {
        let mut entry = self
            .entries
            .get_mut(id)
            .filter(|e| e.status == HostingStatus::Hosted)
            .ok_or_else(|| WaypostError::NotFound("hosted identity".into()))?;

        let profile = &mut entry.profile;
        if let Some(name) = update.name {
            profile.name = name;
        }
        if let Some(location) = update.location {
            profile.location = Some(location);
        }
        if let Some(extra_data) = update.extra_data {
            profile.extra_data = extra_data;
        }
        if let Some(thumbnail) = update.thumbnail {
            profile.thumbnail = (!thumbnail.is_empty()).then_some(thumbnail);
        }
        profile.version += 1;
        debug!(identity = %id, version = profile.version, "Profile updated");
        Ok(profile.clone())
    }

    /// End the hosting agreement of `id`.
    pub fn cancel_hosting(&self, id: &IdentityId, redirect: Option<IdentityId>) -> WaypostResult<()> {
        let mut entry = self
            .entries
            .get_mut(id)
            .filter(|e| e.status == HostingStatus::Hosted)
            .ok_or_else(|| WaypostError::NotFound("hosted identity".into()))?;
        entry.status = HostingStatus::Redirected(redirect);
        entry.profile = Profile::default();
        self.hosted.fetch_sub(1, Ordering::Relaxed);
        info!(identity = %id, redirect = ?redirect, "Hosting agreement cancelled");
        Ok(())
    }

    /// Whether `id` has an active hosting agreement.
    pub fn is_hosted(&self, id: &IdentityId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.status == HostingStatus::Hosted)
    }

    /// Copy of the entry for `id`.
    pub fn get(&self, id: &IdentityId) -> Option<DirectoryEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    /// Add or refresh a profile learned from a neighbour node.
    ///
    /// Identities this node knows first-hand are never overwritten.
    pub fn import_neighbor_profile(&self, public_key: &[u8], profile: Profile) -> WaypostResult<IdentityId> {
        let id = IdentityId::from_public_key(public_key);
        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().status != HostingStatus::Neighbor {
                    return Err(WaypostError::AlreadyExists("identity is known locally".into()));
                }
                occupied.get_mut().profile = profile;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DirectoryEntry {
                    public_key: public_key.to_vec(),
                    profile,
                    status: HostingStatus::Neighbor,
                });
            }
        }
        Ok(id)
    }

    /// Searchable records ordered by identity id.
    ///
    /// Redirected identities have no profile and are left out.
    pub fn snapshot(&self, online: &HashSet<IdentityId>) -> Vec<ProfileRecord> {
        let mut records: Vec<ProfileRecord> = self
            .entries
            .iter()
            .filter(|e| !matches!(e.status, HostingStatus::Redirected(_)))
            .map(|e| ProfileRecord {
                identity_id: *e.key(),
                public_key: e.public_key.clone(),
                profile: e.profile.clone(),
                is_hosted: e.status == HostingStatus::Hosted,
                is_online: online.contains(e.key()),
            })
            .collect();
        records.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));
        records
    }
}

fn new_hosted_entry(public_key: &[u8], identity_type: &str) -> DirectoryEntry {
    DirectoryEntry {
        public_key: public_key.to_vec(),
        profile: Profile {
            version: 1,
            profile_type: identity_type.to_string(),
            ..Default::default()
        },
        status: HostingStatus::Hosted,
    }
}
