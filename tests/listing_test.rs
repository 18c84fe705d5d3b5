mod common;

use common::MockS3;
use futures::{StreamExt, TryStreamExt};
use s3xfer::listing::{self, ListRequest};
use s3xfer::s3::S3Error;

fn seeded() -> std::sync::Arc<MockS3> {
    let mock = MockS3::new();
    for key in ["a.txt", "b.txt", "c.txt", "d.txt", "e.txt"] {
        mock.insert("bucket", key, key.as_bytes().to_vec());
    }
    mock.insert("other", "x.txt", b"x".to_vec());
    mock
}

#[tokio::test]
async fn test_five_objects_two_per_page() {
    let mock = seeded();
    let client = common::client(&mock);

    let mut request = ListRequest::new("bucket");
    request.max_keys = 2;
    let pages: Vec<_> = listing::pages(client, request).try_collect().await.unwrap();

    assert_eq!(pages.len(), 3);
    assert_eq!(
        pages.iter().map(|p| p.is_truncated).collect::<Vec<_>>(),
        vec![true, true, false]
    );
    assert_eq!(pages[2].continuation_token, None);

    let keys: Vec<String> = pages
        .iter()
        .flat_map(|p| p.entries.iter().map(|e| e.key.clone()))
        .collect();
    assert_eq!(keys, vec!["a.txt", "b.txt", "c.txt", "d.txt", "e.txt"]);

    // Every page after the first resumes from the previous token
    let tokens: Vec<_> = mock
        .calls()
        .iter()
        .map(|c| c.query.get("continuation-token").cloned())
        .collect();
    assert_eq!(tokens[0], None);
    assert_eq!(tokens[1], pages[0].continuation_token);
    assert_eq!(tokens[2], pages[1].continuation_token);
}

#[tokio::test]
async fn test_list_objects_streams_entries_lazily() {
    let mock = seeded();
    let manager = common::manager(&mock, common::test_config());

    let mut lister = manager.list_objects("bucket", None, None, Some(2));
    let first: Vec<_> = (&mut lister).take(2).try_collect().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(mock.call_count(), 1);

    let rest = lister.collect_all().await.unwrap();
    assert_eq!(
        rest.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
        vec!["c.txt", "d.txt", "e.txt"]
    );
    assert_eq!(mock.call_count(), 3);
    assert_eq!(rest[0].size, 5);
    assert_eq!(rest[0].storage_class.as_deref(), Some("STANDARD"));
}

#[tokio::test]
async fn test_listing_restarts_from_token() {
    let mock = seeded();
    let client = common::client(&mock);

    let page = listing::list_page(&client, "bucket", None, None, None, 2)
        .await
        .unwrap();
    let token = page.continuation_token.clone().unwrap();

    // The same token yields the same page
    let again = listing::list_page(&client, "bucket", None, None, Some(&token), 2)
        .await
        .unwrap();
    let once_more = listing::list_page(&client, "bucket", None, None, Some(&token), 2)
        .await
        .unwrap();
    assert_eq!(again, once_more);

    let mut request = ListRequest::new("bucket");
    request.start_token = Some(token);
    let keys: Vec<String> = listing::ObjectLister::new(client, request)
        .map_ok(|o| o.key)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(keys, vec!["c.txt", "d.txt", "e.txt"]);
}

#[tokio::test]
async fn test_prefix_and_delimiter() {
    let mock = MockS3::new();
    for key in ["photos/2024/a.jpg", "photos/2024/b.jpg", "photos/cover.jpg", "readme.md"] {
        mock.insert("bucket", key, b"x".to_vec());
    }
    let client = common::client(&mock);

    let page = listing::list_page(&client, "bucket", Some("photos/"), Some("/"), None, 100)
        .await
        .unwrap();
    assert!(!page.is_truncated);
    assert_eq!(page.common_prefixes, vec!["photos/2024/"]);
    assert_eq!(
        page.entries.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(),
        vec!["photos/cover.jpg"]
    );

    let empty = listing::list_page(&client, "bucket", Some("nothing/"), None, None, 100)
        .await
        .unwrap();
    assert!(empty.entries.is_empty());
    assert!(!empty.is_truncated);
}

#[tokio::test]
async fn test_invalid_max_keys() {
    let mock = seeded();
    let client = common::client(&mock);

    let err = listing::list_page(&client, "bucket", None, None, None, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, S3Error::InvalidRequest(_)));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_keys_keep_surrounding_whitespace() {
    let mock = MockS3::new();
    mock.insert("bucket", " padded key ", b"x".to_vec());
    mock.insert("bucket", "plain", b"y".to_vec());
    let manager = common::manager(&mock, common::test_config());

    let objects = manager
        .list_objects("bucket", None, None, None)
        .collect_all()
        .await
        .unwrap();
    let keys: Vec<&str> = objects.iter().map(|o| o.key.as_str()).collect();
    assert_eq!(keys, vec![" padded key ", "plain"]);

    // The listed key addresses the real object
    manager.delete_object("bucket", &objects[0].key).await.unwrap();
    assert!(mock.object("bucket", " padded key ").is_none());
    assert!(mock.object("bucket", "plain").is_some());
}
