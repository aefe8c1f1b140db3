//! Search and result paging over the wire.

mod common;

use common::{Client, TestNode};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use waypost_types::identity::NodeKeys;
use waypost_types::profile::{EncodedLocation, Profile, ProfileSummary};
use waypost_wire::message::{ResponseBody, Status, WireRequest, WireResponse};

fn search(profile_type: &str, max_response: u32, max_total: u32) -> WireRequest {
    WireRequest::Search {
        profile_type: profile_type.into(),
        name: String::new(),
        extra_data: String::new(),
        location: None,
        radius: 0,
        max_response_record_count: max_response,
        max_total_record_count: max_total,
        hosted_only: false,
        include_thumbnails: false,
    }
}

fn neighbor(test: &TestNode, profile_type: &str, name: &str, location: Option<EncodedLocation>) {
    let profile = Profile {
        version: 1,
        profile_type: profile_type.into(),
        name: name.into(),
        location,
        extra_data: format!("city=Prague;kind={profile_type}"),
        thumbnail: Some(vec![0xFF; 16]),
    };
    test.node
        .directory()
        .import_neighbor_profile(&NodeKeys::generate().public_key(), profile)
        .unwrap();
}

fn first_page(response: WireResponse) -> (u32, Vec<ProfileSummary>) {
    match response.body {
        Some(ResponseBody::Search {
            total_record_count,
            profiles,
            ..
        }) => (total_record_count, profiles),
        _ => panic!("Expected search results, got {response:?}"),
    }
}

async fn part(
    client: &mut Client<TlsStream<TcpStream>>,
    record_index: u32,
    record_count: u32,
) -> WireResponse {
    client
        .request(WireRequest::SearchPart {
            record_index,
            record_count,
        })
        .await
}

fn names(profiles: &[ProfileSummary]) -> Vec<String> {
    profiles.iter().map(|p| p.profile.name.clone()).collect()
}

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_search_pages_through_results() {
    let test = TestNode::start().await;
    for i in 0..12 {
        neighbor(&test, "Shop", &format!("shop-{i}"), None);
    }
    for i in 0..4 {
        neighbor(&test, "Person", &format!("person-{i}"), None);
    }
    let mut client = test.verified(&NodeKeys::generate()).await;

    let (total, page) = first_page(client.request(search("Shop", 5, 100)).await);
    assert_eq!(total, 12);
    assert_eq!(page.len(), 5);
    assert!(page.iter().all(|p| p.profile.profile_type == "Shop"));
    assert!(page.iter().all(|p| !p.is_hosted && !p.is_online));
    assert!(page.iter().all(|p| p.profile.thumbnail.is_none()));

    let mut paged = Vec::new();
    for index in [0, 5, 10] {
        let count = 5.min(total - index);
        let response = part(&mut client, index, count).await;
        match response.body {
            Some(ResponseBody::SearchPart {
                record_index,
                record_count,
                profiles,
            }) => {
                assert_eq!((record_index, record_count), (index, count));
                paged.extend(profiles);
            }
            _ => panic!("Expected search part, got {response:?}"),
        }
    }
    assert_eq!(names(&paged[..5]), names(&page));

    // Re-reading a part is stable.
    let again = part(&mut client, 5, 5).await;
    let Some(ResponseBody::SearchPart { profiles, .. }) = again.body else {
        panic!("Expected search part, got {again:?}");
    };
    assert_eq!(names(&profiles), names(&paged[5..10]));

    let (_, everything) = first_page(client.request(search("Shop", 12, 12)).await);
    assert_eq!(names(&everything), names(&paged));

    let past_end = part(&mut client, 12, 1).await;
    assert_eq!(past_end.status, Status::ErrorInvalidValue);
    assert_eq!(past_end.details, "recordIndex");
    let too_many = part(&mut client, 10, 3).await;
    assert_eq!(too_many.details, "recordCount");
}

#[tokio::test]
async fn test_total_limit_truncates_results() {
    let test = TestNode::start().await;
    for i in 0..8 {
        neighbor(&test, "Shop", &format!("shop-{i}"), None);
    }
    let mut client = test.verified(&NodeKeys::generate()).await;

    let (total, page) = first_page(client.request(search("", 2, 3)).await);
    assert_eq!(total, 3);
    assert_eq!(page.len(), 2);
}

#[tokio::test]
async fn test_search_part_needs_a_prior_search() {
    let test = TestNode::start().await;
    let mut client = test.verified(&NodeKeys::generate()).await;

    let response = part(&mut client, 0, 1).await;
    assert_eq!(response.status, Status::ErrorNotAvailable);
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_invalid_queries_name_the_field() {
    let test = TestNode::start().await;
    let mut client = test.verified(&NodeKeys::generate()).await;

    let response = client.request(search("", 0, 10)).await;
    assert_eq!(response.status, Status::ErrorInvalidValue);
    assert_eq!(response.details, "maxResponseRecordCount");

    let response = client.request(search("", 20, 10)).await;
    assert_eq!(response.details, "maxResponseRecordCount");

    let mut bad_pattern = search("", 10, 10);
    if let WireRequest::Search { extra_data, .. } = &mut bad_pattern {
        *extra_data = "(?P<x>a)".into();
    }
    let response = client.request(bad_pattern).await;
    assert_eq!(response.details, "extraData");

    let mut no_radius = search("", 10, 10);
    if let WireRequest::Search { location, .. } = &mut no_radius {
        *location = Some(EncodedLocation {
            latitude: 50_000_000,
            longitude: 14_000_000,
        });
    }
    let response = client.request(no_radius).await;
    assert_eq!(response.details, "radius");

    // A failed search leaves no cursor behind.
    assert_eq!(part(&mut client, 0, 1).await.status, Status::ErrorNotAvailable);
}

#[tokio::test]
async fn test_hosted_online_and_radius_filters() {
    let test = TestNode::start().await;
    let center = EncodedLocation {
        latitude: 50_000_000,
        longitude: 14_000_000,
    };
    neighbor(
        &test,
        "Person",
        "near",
        Some(EncodedLocation {
            latitude: 50_010_000,
            longitude: 14_000_000,
        }),
    );
    neighbor(
        &test,
        "Person",
        "far",
        Some(EncodedLocation {
            latitude: 51_000_000,
            longitude: 14_000_000,
        }),
    );
    neighbor(&test, "Person", "nowhere", None);

    let mut hosted = test.checked_in(&NodeKeys::generate()).await;
    let updated = hosted
        .request(WireRequest::UpdateProfile {
            name: Some("local".into()),
            location: Some(center),
            extra_data: Some("city=Prague".into()),
            thumbnail: None,
        })
        .await;
    assert_eq!(updated.status, Status::Ok);

    let mut client = test.verified(&NodeKeys::generate()).await;

    let mut hosted_only = search("Person", 10, 10);
    if let WireRequest::Search { hosted_only: flag, .. } = &mut hosted_only {
        *flag = true;
    }
    let (total, page) = first_page(client.request(hosted_only).await);
    assert_eq!(total, 1);
    assert_eq!(names(&page), ["local"]);
    assert!(page[0].is_hosted);
    assert!(page[0].is_online);

    let mut nearby = search("Person", 10, 10);
    if let WireRequest::Search {
        location, radius, ..
    } = &mut nearby
    {
        *location = Some(center);
        *radius = 10_000;
    }
    let (_, page) = first_page(client.request(nearby).await);
    let mut found = names(&page);
    found.sort();
    assert_eq!(found, ["local", "near"]);

    let mut by_name = search("", 10, 10);
    if let WireRequest::Search { name, .. } = &mut by_name {
        *name = "n*".into();
    }
    let (_, page) = first_page(client.request(by_name).await);
    let mut found = names(&page);
    found.sort();
    assert_eq!(found, ["near", "nowhere"]);
}
