//! Search query validation and execution.

use crate::cursor::SearchResultSet;
use crate::geo;
use crate::pattern::ExtraDataPattern;
use crate::wildcard::wildcard_match;
use crate::{SearchError, SearchResult};
use tracing::debug;
use waypost_types::config::SearchLimits;
use waypost_types::profile::{EncodedLocation, ProfileRecord};

/// A search request as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Wildcard pattern on the profile type. Empty matches everything.
    pub profile_type: String,
    /// Wildcard pattern on the profile name. Empty matches everything.
    pub name: String,
    /// Regular expression on the extra data. Empty matches everything.
    pub extra_data: String,
    /// Center of the radius filter.
    pub location: Option<EncodedLocation>,
    /// Radius around `location`, in metres.
    pub radius: u32,
    pub max_response_record_count: u32,
    pub max_total_record_count: u32,
    /// Skip profiles imported from neighbours.
    pub hosted_only: bool,
    pub include_thumbnails: bool,
}

impl SearchQuery {
    /// Validate every field, in a fixed order, and compile the filters.
    ///
    /// The first failing check names the field reported to the client.
    pub fn compile(self, limits: &SearchLimits) -> SearchResult<CompiledQuery> {
        let response = self.max_response_record_count;
        let total = self.max_total_record_count;

        let response_ceiling = if self.include_thumbnails {
            limits.max_response_records_with_thumbnails
        } else {
            limits.max_response_records
        };
        if !(1..=response_ceiling).contains(&response) || response > total {
            return Err(SearchError::InvalidValue("maxResponseRecordCount"));
        }
        if self.include_thumbnails && !(1..=limits.max_total_records_with_thumbnails).contains(&total)
        {
            return Err(SearchError::InvalidValue("maxTotalRecordCount"));
        }
        if !(1..=limits.max_total_records).contains(&total) {
            return Err(SearchError::InvalidValue("maxTotalRecordCount"));
        }

        if self.profile_type.len() > limits.max_type_bytes {
            return Err(SearchError::InvalidValue("type"));
        }
        if self.name.len() > limits.max_name_bytes {
            return Err(SearchError::InvalidValue("name"));
        }
        if self.extra_data.len() > limits.max_extra_data_bytes {
            return Err(SearchError::InvalidValue("extraData"));
        }
        let extra_data = if self.extra_data.is_empty() {
            None
        } else {
            match ExtraDataPattern::compile(&self.extra_data) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    debug!(pattern = %self.extra_data, error = %e, "Refusing extra data pattern");
                    return Err(SearchError::InvalidValue("extraData"));
                }
            }
        };

        if let Some(location) = &self.location {
            if !location.is_latitude_valid() {
                return Err(SearchError::InvalidValue("latitude"));
            }
            if !location.is_longitude_valid() {
                return Err(SearchError::InvalidValue("longitude"));
            }
            if self.radius == 0 {
                return Err(SearchError::InvalidValue("radius"));
            }
        }

        Ok(CompiledQuery {
            page_ceiling: response_ceiling,
            query: self,
            extra_data,
        })
    }
}

/// A validated query ready to run.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    query: SearchQuery,
    extra_data: Option<ExtraDataPattern>,
    page_ceiling: u32,
}

impl CompiledQuery {
    /// The query this was compiled from.
    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    /// Whether `record` satisfies every active predicate.
    pub fn matches(&self, record: &ProfileRecord) -> bool {
        let q = &self.query;
        if q.hosted_only && !record.is_hosted {
            return false;
        }
        if !q.profile_type.is_empty() && !wildcard_match(&q.profile_type, &record.profile.profile_type)
        {
            return false;
        }
        if !q.name.is_empty() && !wildcard_match(&q.name, &record.profile.name) {
            return false;
        }
        if let Some(pattern) = &self.extra_data {
            if !pattern.is_match(&record.profile.extra_data) {
                return false;
            }
        }
        if let Some(center) = &q.location {
            match &record.profile.location {
                Some(point) => {
                    if !geo::within_radius(center, point, q.radius) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    /// Scan `candidates` in order and keep matches up to the total ceiling.
    pub fn run<'a, I>(&self, candidates: I) -> SearchResultSet
    where
        I: IntoIterator<Item = &'a ProfileRecord>,
    {
        let limit = self.query.max_total_record_count as usize;
        let records: Vec<_> = candidates
            .into_iter()
            .filter(|record| self.matches(record))
            .take(limit)
            .map(|record| record.summary(self.query.include_thumbnails))
            .collect();
        debug!(matched = records.len(), limit, "Search finished");
        SearchResultSet::new(records, self.query.include_thumbnails, self.page_ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypost_types::identity::IdentityId;
    use waypost_types::profile::Profile;

    fn limits() -> SearchLimits {
        SearchLimits::default()
    }

    fn query(response: u32, total: u32) -> SearchQuery {
        SearchQuery {
            max_response_record_count: response,
            max_total_record_count: total,
            ..Default::default()
        }
    }

    fn record(n: u8, kind: &str, name: &str, extra: &str, loc: Option<(f64, f64)>) -> ProfileRecord {
        let public_key = vec![n; 32];
        ProfileRecord {
            identity_id: IdentityId::from_public_key(&public_key),
            public_key,
            profile: Profile {
                version: 1,
                profile_type: kind.into(),
                name: name.into(),
                location: loc.map(|(lat, lon)| EncodedLocation {
                    latitude: (lat * 1e6) as i32,
                    longitude: (lon * 1e6) as i32,
                }),
                extra_data: extra.into(),
                thumbnail: Some(vec![n]),
            },
            is_hosted: n % 2 == 0,
            is_online: false,
        }
    }

    fn candidates() -> Vec<ProfileRecord> {
        vec![
            record(0, "Person", "Alice", "city=Prague;", Some((50.0755, 14.4378))),
            record(1, "Person", "Bob", "city=Vienna;", Some((48.2082, 16.3738))),
            record(2, "Shop", "Bakery", "city=Prague;open=24h;", Some((50.08, 14.42))),
            record(3, "Person", "Alina", "", None),
        ]
    }

    fn names(set: &SearchResultSet) -> Vec<String> {
        set.first_page(set.total_record_count())
            .iter()
            .map(|s| s.profile.name.clone())
            .collect()
    }

    #[test]
    fn test_validation_order() {
        let l = limits();
        let err = |q: SearchQuery| q.compile(&l).unwrap_err();

        let mut q = query(101, 200);
        q.include_thumbnails = true;
        assert_eq!(err(q), SearchError::InvalidValue("maxResponseRecordCount"));
        assert_eq!(err(query(0, 10)), SearchError::InvalidValue("maxResponseRecordCount"));
        assert_eq!(err(query(1001, 5000)), SearchError::InvalidValue("maxResponseRecordCount"));
        assert_eq!(err(query(20, 10)), SearchError::InvalidValue("maxResponseRecordCount"));

        let mut q = query(10, 1001);
        q.include_thumbnails = true;
        assert_eq!(err(q), SearchError::InvalidValue("maxTotalRecordCount"));
        assert_eq!(err(query(10, 10_001)), SearchError::InvalidValue("maxTotalRecordCount"));

        let mut q = query(10, 10);
        q.profile_type = "t".repeat(65);
        q.name = "n".repeat(65);
        assert_eq!(err(q.clone()), SearchError::InvalidValue("type"));
        q.profile_type.clear();
        assert_eq!(err(q), SearchError::InvalidValue("name"));

        let mut q = query(10, 10);
        q.extra_data = "x".repeat(257);
        assert_eq!(err(q), SearchError::InvalidValue("extraData"));

        let mut q = query(10, 10);
        q.extra_data = "(?<n>a)".into();
        assert_eq!(err(q), SearchError::InvalidValue("extraData"));
    }

    #[test]
    fn test_name_limit_counts_utf8_bytes() {
        let mut q = query(10, 10);
        // 33 two-byte characters = 66 bytes.
        q.name = "ž".repeat(33);
        assert_eq!(q.compile(&limits()).unwrap_err(), SearchError::InvalidValue("name"));
    }

    #[test]
    fn test_location_validation() {
        let mut q = query(10, 10);
        q.location = Some(EncodedLocation {
            latitude: 91_000_000,
            longitude: 0,
        });
        q.radius = 100;
        assert_eq!(q.clone().compile(&limits()).unwrap_err(), SearchError::InvalidValue("latitude"));

        q.location = Some(EncodedLocation {
            latitude: 0,
            longitude: -181_000_000,
        });
        assert_eq!(q.clone().compile(&limits()).unwrap_err(), SearchError::InvalidValue("longitude"));

        q.location = Some(EncodedLocation {
            latitude: 0,
            longitude: 0,
        });
        q.radius = 0;
        assert_eq!(q.compile(&limits()).unwrap_err(), SearchError::InvalidValue("radius"));
    }

    #[test]
    fn test_no_filters_returns_everything() {
        let c = candidates();
        let set = query(10, 100).compile(&limits()).unwrap().run(&c);
        assert_eq!(set.total_record_count(), 4);
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let c = candidates();
        let mut q = query(10, 100);
        q.profile_type = "Person".into();
        q.name = "Ali*".into();
        assert_eq!(names(&q.clone().compile(&limits()).unwrap().run(&c)), ["Alice", "Alina"]);

        q.extra_data = "city=Prague".into();
        assert_eq!(names(&q.compile(&limits()).unwrap().run(&c)), ["Alice"]);
    }

    #[test]
    fn test_radius_filter_skips_profiles_without_location() {
        let c = candidates();
        let mut q = query(10, 100);
        q.location = Some(EncodedLocation {
            latitude: 50_075_500,
            longitude: 14_437_800,
        });
        q.radius = 10_000;
        assert_eq!(names(&q.compile(&limits()).unwrap().run(&c)), ["Alice", "Bakery"]);
    }

    #[test]
    fn test_hosted_only() {
        let c = candidates();
        let mut q = query(10, 100);
        q.hosted_only = true;
        assert_eq!(names(&q.compile(&limits()).unwrap().run(&c)), ["Alice", "Bakery"]);
    }

    #[test]
    fn test_total_ceiling_and_thumbnails() {
        let c = candidates();
        let set = query(1, 2).compile(&limits()).unwrap().run(&c);
        assert_eq!(set.total_record_count(), 2);
        assert_eq!(set.first_page(1).len(), 1);
        assert!(set.first_page(1)[0].profile.thumbnail.is_none());
        assert_eq!(set.page_ceiling(), 1000);

        let mut q = query(1, 2);
        q.include_thumbnails = true;
        let set = q.compile(&limits()).unwrap().run(&c);
        assert!(set.first_page(1)[0].profile.thumbnail.is_some());
        assert_eq!(set.page_ceiling(), 100);
    }
}
