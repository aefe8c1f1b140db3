//! Identity profiles as stored by the directory and returned by search.

use crate::identity::IdentityId;
use serde::{Deserialize, Serialize};

/// Fixed-point scale of encoded coordinates (micro-degrees).
pub const LOCATION_SCALE: f64 = 1_000_000.0;

/// A GPS position encoded as micro-degrees.
///
/// Valid latitudes are `[-90°, 90°]`, valid longitudes `[-180°, 180°]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedLocation {
    /// Latitude in micro-degrees.
    pub latitude: i32,
    /// Longitude in micro-degrees.
    pub longitude: i32,
}

impl EncodedLocation {
    /// Whether the latitude lies in `[-90°, 90°]`.
    pub fn is_latitude_valid(&self) -> bool {
        (-90_000_000..=90_000_000).contains(&self.latitude)
    }

    /// Whether the longitude lies in `[-180°, 180°]`.
    pub fn is_longitude_valid(&self) -> bool {
        (-180_000_000..=180_000_000).contains(&self.longitude)
    }

    /// Latitude in degrees.
    pub fn latitude_degrees(&self) -> f64 {
        f64::from(self.latitude) / LOCATION_SCALE
    }

    /// Longitude in degrees.
    pub fn longitude_degrees(&self) -> f64 {
        f64::from(self.longitude) / LOCATION_SCALE
    }
}

/// Public profile of an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Bumped on every update.
    pub version: u32,
    /// Identity type, e.g. `"Person"` or `"Shop"`.
    #[serde(rename = "type")]
    pub profile_type: String,
    /// Display name.
    pub name: String,
    /// Optional position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<EncodedLocation>,
    /// Free-form `key=value;key=value` data matched by search patterns.
    pub extra_data: String,
    /// Small profile image.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::serde_compat::base64_bytes_opt"
    )]
    pub thumbnail: Option<Vec<u8>>,
}

/// A search candidate: a profile plus where it lives.
#[derive(Debug, Clone)]
pub struct ProfileRecord {
    /// Identity id of the profile owner.
    pub identity_id: IdentityId,
    /// Public key of the profile owner.
    pub public_key: Vec<u8>,
    /// The profile itself.
    pub profile: Profile,
    /// Hosted by this node (as opposed to imported from a neighbour).
    pub is_hosted: bool,
    /// Currently checked in.
    pub is_online: bool,
}

impl ProfileRecord {
    /// Project the record into its wire summary.
    pub fn summary(&self, include_thumbnail: bool) -> ProfileSummary {
        let mut profile = self.profile.clone();
        if !include_thumbnail {
            profile.thumbnail = None;
        }
        ProfileSummary {
            public_key: self.public_key.clone(),
            profile,
            is_hosted: self.is_hosted,
            is_online: self.is_online,
        }
    }
}

/// What a search result reports about one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    /// Owner's public key.
    #[serde(with = "crate::serde_compat::base64_bytes")]
    pub public_key: Vec<u8>,
    /// Profile contents (thumbnail only when requested).
    pub profile: Profile,
    /// Hosted by the answering node.
    pub is_hosted: bool,
    /// Checked in at the answering node.
    pub is_online: bool,
}
