//! Request handling tests for the basic methods: OPTIONS, GET/HEAD, PUT,
//! PATCH, DELETE and MKCOL, plus the generic precondition pipeline.

mod common;

use common::{cancelled_body, TestDav};
use http::StatusCode;
use oxdav_core::{Access, CanonicalPath, DavConfig, DavMethod};
use std::sync::Arc;

// ============================================================================
// OPTIONS
// ============================================================================

#[test]
fn test_options_advertises_dav_classes() {
    let t = TestDav::memory();
    let reply = t.send(t.request("OPTIONS", "/"));
    reply.assert_status(StatusCode::OK);
    assert_eq!(reply.header("dav"), Some("1, 2"));
    let allow = reply.header("allow").unwrap();
    for method in ["PROPFIND", "LOCK", "PUT", "MKCOL"] {
        assert!(allow.contains(method), "Allow lacks {method}: {allow}");
    }
}

#[test]
fn test_read_only_refuses_mutations() {
    let t = TestDav::memory_with(DavConfig {
        read_only: true,
        ..DavConfig::default()
    });
    let reply = t.put("/file.txt", "x");
    reply.assert_status(StatusCode::METHOD_NOT_ALLOWED);
    let allow = reply.header("allow").unwrap();
    assert!(allow.contains("GET"));
    assert!(!allow.contains("PUT"));

    t.mkcol("/dir").assert_status(StatusCode::METHOD_NOT_ALLOWED);
    t.send(t.request("OPTIONS", "/")).assert_status(StatusCode::OK);
}

#[test]
fn test_unknown_method_not_allowed() {
    let t = TestDav::memory();
    t.send(t.request("TRACE", "/"))
        .assert_status(StatusCode::METHOD_NOT_ALLOWED);
}

// ============================================================================
// Path resolution and authorization
// ============================================================================

#[test]
fn test_traversal_outside_root_is_bad_request() {
    let t = TestDav::memory();
    t.get("/../../etc/passwd")
        .assert_status(StatusCode::BAD_REQUEST);
    t.get("/a/%2e%2e/%2e%2e/x")
        .assert_status(StatusCode::BAD_REQUEST);
}

#[test]
fn test_prefix_is_stripped() {
    let t = TestDav::memory_with(DavConfig {
        prefix: "/webdav".to_string(),
        ..DavConfig::default()
    });
    t.put("/webdav/a.txt", "hello")
        .assert_status(StatusCode::CREATED);
    assert_eq!(&t.get_body("/webdav/a.txt")[..], b"hello");
    t.get("/a.txt").assert_status(StatusCode::BAD_REQUEST);
}

#[test]
fn test_authorizer_denies_with_forbidden() {
    let t = TestDav::memory();
    let only_alice = |principal: Option<&str>, _: &CanonicalPath, method: DavMethod| {
        if principal == Some("alice") || !method.is_mutating() {
            Access::Allow
        } else {
            Access::Deny
        }
    };
    let dav = t.dav.with_authorizer(Arc::new(only_alice));

    let put = |principal: Option<&str>| {
        let mut request = t_request("PUT", "/doc.txt").body("x");
        if let Some(principal) = principal {
            request = request.principal(principal);
        }
        dav.handle(request).status
    };
    assert_eq!(put(None), StatusCode::FORBIDDEN);
    assert_eq!(put(Some("bob")), StatusCode::FORBIDDEN);
    assert_eq!(put(Some("alice")), StatusCode::CREATED);
    assert_eq!(
        dav.handle(t_request("GET", "/doc.txt")).status,
        StatusCode::OK
    );
}

#[test]
fn test_authorizer_checks_destination() {
    let t = TestDav::memory();
    t.put_ok("/public.txt", "x");
    t.mkcol_ok("/private");
    let dav = t.dav.with_authorizer(Arc::new(
        |_: Option<&str>, path: &CanonicalPath, _: DavMethod| {
            if path.segments().first().is_some_and(|s| s == "private") {
                Access::Deny
            } else {
                Access::Allow
            }
        },
    ));
    let reply = dav.handle(
        t_request("COPY", "/public.txt").header("destination", "/private/copy.txt"),
    );
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

fn t_request(method: &str, path: &str) -> oxdav_core::DavRequest {
    oxdav_core::DavRequest::new(http::Method::from_bytes(method.as_bytes()).unwrap(), path)
}

// ============================================================================
// PUT / GET / HEAD
// ============================================================================

#[test]
fn test_put_then_get_round_trip() {
    for t in [TestDav::memory(), TestDav::local()] {
        let created = t.put("/notes.txt", "first version");
        created.assert_status(StatusCode::CREATED);
        let first_tag = created.header("etag").unwrap().to_string();

        let replaced = t.put("/notes.txt", "second, longer version");
        replaced.assert_status(StatusCode::NO_CONTENT);
        let second_tag = replaced.header("etag").unwrap().to_string();
        assert_ne!(first_tag, second_tag);

        let reply = t.get("/notes.txt");
        reply.assert_status(StatusCode::OK);
        assert_eq!(&reply.body[..], b"second, longer version");
        assert_eq!(reply.header("etag"), Some(second_tag.as_str()));
        assert_eq!(reply.header("content-type"), Some("text/plain"));
        assert!(reply.header("last-modified").is_some());
    }
}

#[test]
fn test_head_has_length_but_no_body() {
    let t = TestDav::memory();
    t.put_ok("/data.bin", vec![7u8; 42]);
    let reply = t.send(t.request("HEAD", "/data.bin"));
    reply.assert_status(StatusCode::OK);
    assert_eq!(reply.header("content-length"), Some("42"));
    assert!(reply.body.is_empty());
}

#[test]
fn test_get_missing_is_not_found() {
    let t = TestDav::memory();
    t.get("/nothing").assert_status(StatusCode::NOT_FOUND);
}

#[test]
fn test_put_without_parent_conflicts() {
    let t = TestDav::local();
    t.put("/missing/child.txt", "x")
        .assert_status(StatusCode::CONFLICT);
}

#[test]
fn test_put_on_collection_not_allowed() {
    let t = TestDav::memory();
    t.mkcol_ok("/dir");
    t.put("/dir", "x")
        .assert_status(StatusCode::METHOD_NOT_ALLOWED);
}

#[test]
fn test_put_with_content_range_rejected() {
    let t = TestDav::memory();
    let reply = t.send(
        t.request("PUT", "/a.txt")
            .header("content-range", "bytes 0-1/2")
            .body("ab"),
    );
    reply.assert_status(StatusCode::BAD_REQUEST);
    t.get("/a.txt").assert_status(StatusCode::NOT_FOUND);
}

#[test]
fn test_cancelled_write_reports_error_and_keeps_old_content() {
    for t in [TestDav::memory(), TestDav::local()] {
        t.put_ok("/keep.txt", "original");
        let (body, cancel) = cancelled_body(b"replacement");
        let mut request = t.request("PUT", "/keep.txt");
        request.body = body;
        request.cancel = cancel;

        let reply = t.send(request);
        assert!(
            reply.status.is_server_error(),
            "cancelled write must not succeed, got {}",
            reply.status
        );
        assert_eq!(&t.get_body("/keep.txt")[..], b"original");
    }
}

#[test]
fn test_cancelled_write_leaves_no_temp_files() {
    let t = TestDav::local();
    let (body, cancel) = cancelled_body(b"abc");
    let mut request = t.request("PUT", "/new.txt");
    request.body = body;
    request.cancel = cancel;
    assert!(t.send(request).status.is_server_error());

    let leftovers: Vec<_> = std::fs::read_dir(t.root_dir()).unwrap().collect();
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    t.get("/new.txt").assert_status(StatusCode::NOT_FOUND);
}

// ============================================================================
// Ranges
// ============================================================================

#[test]
fn test_range_returns_partial_content() {
    let t = TestDav::memory();
    t.put_ok("/digits", "0123456789");

    let reply = t.send(t.request("GET", "/digits").header("range", "bytes=2-5"));
    reply.assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(&reply.body[..], b"2345");
    assert_eq!(reply.header("content-range"), Some("bytes 2-5/10"));

    let suffix = t.send(t.request("GET", "/digits").header("range", "bytes=-3"));
    suffix.assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(&suffix.body[..], b"789");
}

#[test]
fn test_unsatisfiable_range() {
    let t = TestDav::memory();
    t.put_ok("/digits", "0123456789");
    let reply = t.send(t.request("GET", "/digits").header("range", "bytes=20-"));
    reply.assert_status(StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(reply.header("content-range"), Some("bytes */10"));
}

#[test]
fn test_multi_range_serves_everything() {
    let t = TestDav::memory();
    t.put_ok("/digits", "0123456789");
    let reply = t.send(
        t.request("GET", "/digits")
            .header("range", "bytes=0-1,4-5"),
    );
    reply.assert_status(StatusCode::OK);
    assert_eq!(&reply.body[..], b"0123456789");
}

// ============================================================================
// Conditional requests
// ============================================================================

#[test]
fn test_if_match_mismatch_fails_precondition() {
    let t = TestDav::memory();
    t.put_ok("/a.txt", "v1");
    let reply = t.send(
        t.request("PUT", "/a.txt")
            .header("if-match", "\"not-the-tag\"")
            .body("v2"),
    );
    reply.assert_status(StatusCode::PRECONDITION_FAILED);
    assert_eq!(&t.get_body("/a.txt")[..], b"v1");
}

#[test]
fn test_if_match_current_tag_succeeds() {
    let t = TestDav::memory();
    let tag = t.put("/a.txt", "v1").header("etag").unwrap().to_string();
    t.send(t.request("PUT", "/a.txt").header("if-match", &tag).body("v2"))
        .assert_status(StatusCode::NO_CONTENT);
}

#[test]
fn test_if_none_match_star_prevents_overwrite() {
    let t = TestDav::memory();
    let create = || {
        t.send(
            t.request("PUT", "/once.txt")
                .header("if-none-match", "*")
                .body("x"),
        )
    };
    create().assert_status(StatusCode::CREATED);
    create().assert_status(StatusCode::PRECONDITION_FAILED);
}

#[test]
fn test_if_none_match_on_get_is_not_modified() {
    let t = TestDav::memory();
    let tag = t.put("/a.txt", "v1").header("etag").unwrap().to_string();
    let reply = t.send(t.request("GET", "/a.txt").header("if-none-match", &tag));
    reply.assert_status(StatusCode::NOT_MODIFIED);
    assert!(reply.body.is_empty());
}

#[test]
fn test_if_header_etag_condition() {
    let t = TestDav::memory();
    let tag = t.put("/a.txt", "v1").header("etag").unwrap().to_string();
    t.send(
        t.request("PUT", "/a.txt")
            .header("if", "([\"stale\"])")
            .body("v2"),
    )
    .assert_status(StatusCode::PRECONDITION_FAILED);
    t.send(
        t.request("PUT", "/a.txt")
            .header("if", format!("([{tag}])"))
            .body("v2"),
    )
    .assert_status(StatusCode::NO_CONTENT);
}

#[test]
fn test_malformed_headers_are_bad_requests() {
    let t = TestDav::memory();
    t.put_ok("/a.txt", "x");
    t.send(t.request("PUT", "/a.txt").header("if", "no parens").body("y"))
        .assert_status(StatusCode::BAD_REQUEST);
    t.send(t.request("PROPFIND", "/").header("depth", "2"))
        .assert_status(StatusCode::BAD_REQUEST);
    t.send(
        t.request("COPY", "/a.txt")
            .header("destination", "/b.txt")
            .header("overwrite", "maybe"),
    )
    .assert_status(StatusCode::BAD_REQUEST);
}

// ============================================================================
// PATCH (append)
// ============================================================================

#[test]
fn test_patch_appends() {
    let t = TestDav::local();
    t.put_ok("/log.txt", "line 1\n");
    t.send(
        t.request("PATCH", "/log.txt")
            .header("x-update-range", "append")
            .body("line 2\n"),
    )
    .assert_status(StatusCode::NO_CONTENT);
    assert_eq!(&t.get_body("/log.txt")[..], b"line 1\nline 2\n");
}

#[test]
fn test_patch_requires_append_header() {
    let t = TestDav::memory();
    t.put_ok("/log.txt", "a");
    t.send(t.request("PATCH", "/log.txt").body("b"))
        .assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(&t.get_body("/log.txt")[..], b"a");
}

// ============================================================================
// MKCOL / DELETE
// ============================================================================

#[test]
fn test_mkcol_statuses() {
    let t = TestDav::local();
    t.mkcol_ok("/docs");
    t.mkcol("/docs").assert_status(StatusCode::METHOD_NOT_ALLOWED);
    t.mkcol("/missing/sub").assert_status(StatusCode::CONFLICT);
    t.send(t.request("MKCOL", "/withbody").body("<x/>"))
        .assert_status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    t.mkcol("/withbody").assert_status(StatusCode::CREATED);
}

#[test]
fn test_delete_collection_recursively() {
    let t = TestDav::local();
    t.mkcol_ok("/tree");
    t.mkcol_ok("/tree/sub");
    t.put_ok("/tree/sub/leaf.txt", "x");

    t.delete("/tree").assert_status(StatusCode::NO_CONTENT);
    t.get("/tree").assert_status(StatusCode::NOT_FOUND);
    t.get("/tree/sub/leaf.txt")
        .assert_status(StatusCode::NOT_FOUND);
    t.delete("/tree").assert_status(StatusCode::NOT_FOUND);
}

#[test]
fn test_delete_depth_zero_rejected() {
    let t = TestDav::memory();
    t.mkcol_ok("/tree");
    t.send(t.request("DELETE", "/tree").header("depth", "0"))
        .assert_status(StatusCode::BAD_REQUEST);
    t.delete("/").assert_status(StatusCode::FORBIDDEN);
}

// ============================================================================
// Collection listings
// ============================================================================

#[test]
fn test_collection_listing_sorted_and_hides_dotfiles() {
    let t = TestDav::memory();
    t.mkcol_ok("/dir");
    t.put_ok("/dir/b.txt", "b");
    t.put_ok("/dir/a.txt", "a");
    t.put_ok("/dir/.secret", "s");
    t.mkcol_ok("/dir/c");

    let first = t.get("/dir/");
    first.assert_status(StatusCode::OK);
    assert_eq!(
        first.header("content-type"),
        Some("text/html; charset=utf-8")
    );
    let html = first.text();
    let a = html.find("/dir/a.txt").unwrap();
    let b = html.find("/dir/b.txt").unwrap();
    let c = html.find("/dir/c/").unwrap();
    assert!(a < b && b < c, "listing out of order: {html}");
    assert!(!html.contains(".secret"));

    let second = t.get("/dir/");
    assert_eq!(first.body, second.body);

    assert_eq!(&t.get_body("/dir/.secret")[..], b"s");
}

#[test]
fn test_collection_listing_can_show_hidden() {
    let t = TestDav::memory_with(DavConfig {
        show_hidden: true,
        ..DavConfig::default()
    });
    t.put_ok("/.profile", "x");
    assert!(t.get("/").text().contains(".profile"));
}
