//! Paginator and iterator behaviour against a paged collection.

use super::*;
use futures::TryStreamExt;
use integrations_bitbucket::mocks::fixtures;
use integrations_bitbucket::{ErrorKind, PageIterator, PaginationOptions, Pipeline};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer};

const COLLECTION: &str = "/repositories/ws/repo/things";

async fn mount_pages(server: &MockServer, pages: Vec<Vec<serde_json::Value>>) {
    let total = pages.len();
    for (index, values) in pages.into_iter().enumerate() {
        let number = index as u32 + 1;
        let next = (index + 1 < total)
            .then(|| format!("{}{}?page={}&pagelen=2", server.uri(), COLLECTION, number + 1));
        Mock::given(method("GET"))
            .and(path(COLLECTION))
            .and(query_param("page", number.to_string()))
            .respond_with(json_response(
                200,
                fixtures::page(values, number, next.as_deref()),
            ))
            .mount(server)
            .await;
    }
}

fn items(ids: &[u32]) -> Vec<serde_json::Value> {
    ids.iter().map(|id| json!({ "id": id })).collect()
}

#[tokio::test]
async fn test_fetch_all_walks_next_links() {
    let server = MockServer::start().await;
    mount_pages(&server, vec![items(&[1, 2]), items(&[3, 4]), items(&[5])]).await;

    let client = client_for(&server);
    let mut paginator = client.paginate(COLLECTION, PaginationOptions::new().pagelen(2));
    let all = paginator.fetch_all(&CancellationToken::new()).await.unwrap();

    let ids: Vec<u64> = all.iter().map(|v| v["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(paginator.fetched(), 5);
    assert!(!paginator.has_next_page());
}

#[tokio::test]
async fn test_limit_stops_before_next_page() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .and(query_param("page", "1"))
        .respond_with(json_response(
            200,
            fixtures::page(
                items(&[1, 2]),
                1,
                Some(&format!("{}{}?page=2", server.uri(), COLLECTION)),
            ),
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .and(query_param("page", "2"))
        .respond_with(json_response(200, fixtures::page(items(&[3]), 2, None)))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let mut paginator = client.paginate(COLLECTION, PaginationOptions::new().limit(2));
    let all = paginator.fetch_all(&CancellationToken::new()).await.unwrap();

    assert_eq!(all.len(), 2);
    assert!(!paginator.has_next_page());
}

#[tokio::test]
async fn test_limit_mid_page_truncates_final_batch() {
    let server = MockServer::start().await;
    mount_pages(&server, vec![items(&[1, 2]), items(&[3, 4]), items(&[5])]).await;

    let client = client_for(&server);
    let mut paginator = client.paginate(COLLECTION, PaginationOptions::new().limit(3));
    let all: Vec<serde_json::Value> = paginator
        .fetch_all_typed(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(all.len(), 3);
    assert_eq!(all[2]["id"], 3);
    assert_eq!(paginator.fetched(), 4);
}

#[tokio::test]
async fn test_first_request_carries_page_params() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .and(query_param("page", "1"))
        .and(query_param("pagelen", "25"))
        .and(query_param("q", "state.name=\"COMPLETED\""))
        .respond_with(json_response(200, fixtures::page(items(&[1]), 1, None)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let options = PaginationOptions::new()
        .pagelen(25)
        .query("q", "state.name=\"COMPLETED\"");
    let mut paginator = client.paginate(COLLECTION, options);

    assert!(paginator.has_next_page());
    let page = paginator
        .next_page(&CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(page.size, 1);
    assert!(paginator
        .next_page(&CancellationToken::new())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_reset_restarts_from_first_page() {
    let server = MockServer::start().await;
    mount_pages(&server, vec![items(&[1, 2]), items(&[3])]).await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();
    let mut paginator = client.paginate(COLLECTION, PaginationOptions::new());

    assert_eq!(paginator.fetch_all(&cancel).await.unwrap().len(), 3);
    assert!(paginator.fetch_all(&cancel).await.unwrap().is_empty());

    paginator.reset();
    assert_eq!(paginator.fetched(), 0);
    assert!(paginator.has_next_page());
    assert_eq!(paginator.fetch_all(&cancel).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_decode_failure_discards_partial_results() {
    let server = MockServer::start().await;
    mount_pages(
        &server,
        vec![
            vec![fixtures::pipeline("{p1}", 1, "SUCCESSFUL")],
            vec![json!({"unexpected": true})],
        ],
    )
    .await;

    let client = client_for(&server);
    let err = client
        .paginate(COLLECTION, PaginationOptions::new())
        .fetch_all_typed::<Pipeline>(&CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[tokio::test]
async fn test_iterator_fetches_lazily() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .and(query_param("page", "1"))
        .respond_with(json_response(
            200,
            fixtures::page(
                items(&[1, 2]),
                1,
                Some(&format!("{}{}?page=2", server.uri(), COLLECTION)),
            ),
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(COLLECTION))
        .and(query_param("page", "2"))
        .respond_with(json_response(200, fixtures::page(items(&[3]), 2, None)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();
    let mut iter = client.iterate::<serde_json::Value>(COLLECTION, PaginationOptions::new());

    assert!(iter.has_next());
    assert_eq!(iter.next(&cancel).await.unwrap().unwrap()["id"], 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(iter.next(&cancel).await.unwrap().unwrap()["id"], 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    assert_eq!(iter.next(&cancel).await.unwrap().unwrap()["id"], 3);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    assert!(iter.next(&cancel).await.unwrap().is_none());
    assert!(iter.next(&cancel).await.unwrap().is_none());
    assert!(!iter.has_next());
}

#[tokio::test]
async fn test_iterator_stream_honours_limit() {
    let server = MockServer::start().await;
    mount_pages(&server, vec![items(&[1, 2]), items(&[3, 4])]).await;

    let client = client_for(&server);
    let stream = client
        .iterate::<serde_json::Value>(COLLECTION, PaginationOptions::new().limit(3))
        .into_stream(CancellationToken::new());
    let collected: Vec<serde_json::Value> = stream.try_collect().await.unwrap();

    assert_eq!(collected.len(), 3);
}

#[tokio::test]
async fn test_iterator_restarts_over_reset_paginator() {
    let server = MockServer::start().await;
    mount_pages(&server, vec![items(&[1, 2]), items(&[3])]).await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();
    let mut iter = client.iterate::<serde_json::Value>(COLLECTION, PaginationOptions::new());

    let mut first = Vec::new();
    while let Some(item) = iter.next(&cancel).await.unwrap() {
        first.push(item);
    }
    assert_eq!(first.len(), 3);
    assert!(!iter.has_next());

    let mut paginator = iter.into_paginator();
    assert_eq!(paginator.current_page().map(|page| page.page), Some(2));
    paginator.reset();
    assert!(paginator.current_page().is_none());

    let mut again = PageIterator::<serde_json::Value>::new(paginator);
    assert!(again.has_next());
    assert_eq!(again.next(&cancel).await.unwrap().unwrap(), first[0]);
}
