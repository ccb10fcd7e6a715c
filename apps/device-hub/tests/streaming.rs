mod common;

use axum::body::Body;
use axum::http::{header, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{json, Value};

use common::{call, eventually, get, harness};

async fn next_chunk(body: &mut Body) -> Bytes {
    loop {
        let frame = body
            .frame()
            .await
            .expect("stream still open")
            .expect("frame readable");
        if let Ok(data) = frame.into_data() {
            if !data.is_empty() {
                return data;
            }
        }
    }
}

fn redirect_url(response: &Value) -> String {
    response["result"]["url"]
        .as_str()
        .expect("redirect url")
        .to_string()
}

#[test_timeout::tokio_timeout_test]
async fn mjpeg_stream_stops_after_consumer_leaves() {
    let hub = harness();
    let app = hub.router();

    let response = call(&app, "device.screencapture", json!({ "format": "mjpeg", "fps": 60 })).await;
    let url = redirect_url(&response);
    assert!(url.starts_with("/session?s="));
    assert_eq!(
        response["result"]["contentType"],
        "multipart/x-mixed-replace; boundary=BoundaryString"
    );
    assert_eq!(response["result"]["expiresInSecs"], 5);

    let stream = get(&app, &url).await;
    assert_eq!(stream.status(), StatusCode::OK);
    assert_eq!(
        stream.headers()[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=BoundaryString"
    );
    let mut body = stream.into_body();
    let first = next_chunk(&mut body).await;
    assert!(first.starts_with(b"--BoundaryString\r\nContent-Type: image/jpeg"));
    next_chunk(&mut body).await;
    assert_eq!(hub.android.active_captures(), 1);

    drop(body);
    assert!(eventually(|| hub.android.active_captures() == 0).await);
    assert!(eventually(|| hub.pipeline.tokens().active() == 0).await);

    // Ended streams do not resolve any more.
    let again = get(&app, &url).await;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[test_timeout::tokio_timeout_test]
async fn token_is_single_use() {
    let hub = harness();
    let app = hub.router();

    let response = call(&app, "device.screencapture", json!({ "format": "avc" })).await;
    let url = redirect_url(&response);

    let first = get(&app, &url).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[header::CONTENT_TYPE], "video/h264");

    let second = get(&app, &url).await;
    assert_eq!(second.status(), StatusCode::NOT_FOUND);
    drop(first);
}

#[test_timeout::tokio_timeout_test]
async fn unknown_token_is_not_found() {
    let hub = harness();
    let response = get(&hub.router(), "/session?s=doesnotexist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[test_timeout::tokio_timeout_test]
async fn ogg_streams_start_with_their_own_headers() {
    let hub = harness();
    let app = hub.router();

    let mut first_pages = Vec::new();
    for _ in 0..2 {
        let response = call(&app, "device.audiocapture", json!({ "format": "ogg" })).await;
        assert_eq!(response["result"]["contentType"], "audio/ogg");
        let stream = get(&app, &redirect_url(&response)).await;
        assert_eq!(stream.status(), StatusCode::OK);
        let mut body = stream.into_body();
        first_pages.push(next_chunk(&mut body).await);
    }

    for page in &first_pages {
        assert_eq!(&page[..4], b"OggS");
        // Beginning-of-stream flag, granule 0, page sequence 0.
        assert_eq!(page[5], 0x02);
        assert_eq!(&page[6..14], &[0u8; 8]);
        assert_eq!(&page[18..22], &[0u8; 4]);
        assert!(page.windows(8).any(|window| window == b"OpusHead"));
    }
    // Both streams share one agent and one audio forward.
    assert_eq!(hub.android.launches(), 1);
    assert_eq!(
        hub.sessions
            .allocator()
            .lease_count(common::BOOTED_ANDROID, device_hub::ports::PortPurpose::Audio),
        1
    );
}

#[test_timeout::tokio_timeout_test]
async fn fresh_tokens_survive_the_recycler() {
    let hub = harness();
    let response = call(&hub.router(), "device.audiocapture", json!({ "format": "opus" })).await;
    let token = redirect_url(&response)
        .trim_start_matches("/session?s=")
        .to_string();
    assert_eq!(hub.pipeline.tokens().active(), 1);

    assert_eq!(hub.pipeline.tokens().expire_idle(), 0);
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(hub.pipeline.tokens().claim(&token).is_some());
}

#[test_timeout::tokio_timeout_test]
async fn stopping_the_agent_releases_stream_ports() {
    let hub = harness();
    let app = hub.router();

    let response = call(&app, "device.screencapture", json!({ "format": "mjpeg" })).await;
    let stream = get(&app, &redirect_url(&response)).await;
    let mut body = stream.into_body();
    next_chunk(&mut body).await;

    hub.sessions.stop(common::BOOTED_ANDROID).await;
    drop(body);
    assert!(eventually(|| hub.android.active_captures() == 0).await);
    assert_eq!(hub.sessions.allocator().active_leases(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn silent_agent_is_restarted_before_capture() {
    let hub = harness();
    let app = hub.router();

    let started = call(&app, "device.agent.start", json!({})).await;
    assert!(started.get("error").is_none(), "unexpected error: {started}");
    assert_eq!(hub.android.launches(), 1);
    hub.android.stall_agents();

    let response = call(&app, "device.screencapture", json!({ "format": "mjpeg" })).await;
    assert!(response.get("error").is_none(), "unexpected error: {response}");
    assert_eq!(hub.android.launches(), 2);

    let stream = get(&app, &redirect_url(&response)).await;
    let mut body = stream.into_body();
    let first = next_chunk(&mut body).await;
    assert!(first.starts_with(b"--BoundaryString"));
}

#[test_timeout::tokio_timeout_test]
async fn agent_stop_ends_open_streams() {
    let hub = harness();
    let app = hub.router();

    let response = call(&app, "device.screencapture", json!({ "format": "mjpeg" })).await;
    let stream = get(&app, &redirect_url(&response)).await;
    let mut body = stream.into_body();
    next_chunk(&mut body).await;

    let stopped = call(&app, "device.agent.stop", json!({})).await;
    assert!(stopped.get("error").is_none(), "unexpected error: {stopped}");

    // Buffered frames may still arrive; the body must then end.
    loop {
        match body.frame().await {
            Some(frame) => {
                frame.expect("frame readable");
            }
            None => break,
        }
    }
    assert!(eventually(|| hub.android.active_captures() == 0).await);
    assert_eq!(hub.pipeline.tokens().active(), 0);
    assert_eq!(hub.sessions.allocator().active_leases(), 0);
    assert_eq!(hub.android.live_forwards(), 0);
}
