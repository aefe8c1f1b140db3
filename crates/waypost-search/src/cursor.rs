//! Per-connection search result cursor.

use crate::{SearchError, SearchResult};
use waypost_types::profile::ProfileSummary;

/// Matches retained from the last search on a connection.
///
/// The set is immutable once built, so any slice read from it is identical
/// every time it is read.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResultSet {
    records: Vec<ProfileSummary>,
    include_thumbnails: bool,
    page_ceiling: u32,
}

impl SearchResultSet {
    /// Wrap matched summaries. `page_ceiling` caps `record_count` of later parts.
    pub fn new(records: Vec<ProfileSummary>, include_thumbnails: bool, page_ceiling: u32) -> Self {
        Self {
            records,
            include_thumbnails,
            page_ceiling,
        }
    }

    /// Number of retained matches.
    pub fn total_record_count(&self) -> u32 {
        self.records.len() as u32
    }

    /// Whether summaries carry thumbnails.
    pub fn include_thumbnails(&self) -> bool {
        self.include_thumbnails
    }

    /// Largest `record_count` a part request may ask for.
    pub fn page_ceiling(&self) -> u32 {
        self.page_ceiling
    }

    /// The first `max_response_record_count` records.
    pub fn first_page(&self, max_response_record_count: u32) -> &[ProfileSummary] {
        let end = self.records.len().min(max_response_record_count as usize);
        &self.records[..end]
    }

    /// Records `[record_index, record_index + record_count)`.
    pub fn part(&self, record_index: u32, record_count: u32) -> SearchResult<&[ProfileSummary]> {
        let total = self.total_record_count();
        if record_index >= total {
            return Err(SearchError::InvalidValue("recordIndex"));
        }
        if record_count == 0
            || record_count > self.page_ceiling
            || u64::from(record_index) + u64::from(record_count) > u64::from(total)
        {
            return Err(SearchError::InvalidValue("recordCount"));
        }
        let start = record_index as usize;
        Ok(&self.records[start..start + record_count as usize])
    }
}

/// Read a part from an optional cursor.
pub fn read_part(
    cursor: Option<&SearchResultSet>,
    record_index: u32,
    record_count: u32,
) -> SearchResult<&[ProfileSummary]> {
    cursor
        .ok_or(SearchError::NoCursor)?
        .part(record_index, record_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypost_types::profile::Profile;

    fn summaries(n: usize) -> Vec<ProfileSummary> {
        (0..n)
            .map(|i| ProfileSummary {
                public_key: vec![i as u8; 32],
                profile: Profile {
                    name: format!("profile-{i}"),
                    ..Default::default()
                },
                is_hosted: true,
                is_online: false,
            })
            .collect()
    }

    #[test]
    fn test_first_page_is_capped() {
        let set = SearchResultSet::new(summaries(5), false, 1000);
        assert_eq!(set.first_page(3).len(), 3);
        assert_eq!(set.first_page(10).len(), 5);
    }

    #[test]
    fn test_part_bounds() {
        let set = SearchResultSet::new(summaries(10), false, 1000);
        assert_eq!(set.part(0, 10).unwrap().len(), 10);
        assert_eq!(set.part(9, 1).unwrap()[0].profile.name, "profile-9");
        assert_eq!(set.part(10, 1), Err(SearchError::InvalidValue("recordIndex")));
        assert_eq!(set.part(5, 6), Err(SearchError::InvalidValue("recordCount")));
        assert_eq!(set.part(5, 0), Err(SearchError::InvalidValue("recordCount")));
        assert_eq!(
            set.part(u32::MAX, u32::MAX),
            Err(SearchError::InvalidValue("recordIndex"))
        );
    }

    #[test]
    fn test_part_respects_ceiling() {
        let set = SearchResultSet::new(summaries(150), true, 100);
        assert!(set.part(0, 100).is_ok());
        assert_eq!(set.part(0, 101), Err(SearchError::InvalidValue("recordCount")));
    }

    #[test]
    fn test_empty_set_has_no_valid_index() {
        let set = SearchResultSet::new(Vec::new(), false, 1000);
        assert_eq!(set.part(0, 1), Err(SearchError::InvalidValue("recordIndex")));
    }

    #[test]
    fn test_parts_are_repeatable_and_cover_the_set() {
        let set = SearchResultSet::new(summaries(25), false, 1000);
        let first = set.part(3, 7).unwrap().to_vec();
        let again = set.part(3, 7).unwrap().to_vec();
        assert_eq!(first, again);

        let mut joined = Vec::new();
        for start in (0..25).step_by(10) {
            let count = (25 - start).min(10);
            joined.extend_from_slice(set.part(start, count).unwrap());
        }
        assert_eq!(joined, set.first_page(25));
    }

    #[test]
    fn test_no_cursor() {
        assert_eq!(read_part(None, 0, 1), Err(SearchError::NoCursor));
    }
}
