//! Host message API driven through JSON, the way an IPC bridge would.

mod common;

use camcore::permissions::FixedPermissions;
use camcore::{CameraHost, CameraId, HostRequest, HostResponse, MediaType, PermissionStatus};
use common::{rig, rig_with};
use serde_json::{json, Value};
use std::time::Duration;

async fn call(host: &CameraHost, request: Value) -> Value {
    host.handle_json(&request.to_string()).await
}

fn error_code(response: &Value) -> &str {
    response["error"]["code"].as_str().unwrap_or("<no error>")
}

#[tokio::test]
async fn test_list_devices_and_formats() {
    let rig = rig();
    let host = CameraHost::new(rig.env.clone());

    let response = call(&host, json!({"method": "listDevices"})).await;
    assert_eq!(response["ok"]["type"], "devices");
    let devices = response["ok"]["devices"].as_array().unwrap();
    let ids: Vec<_> = devices.iter().map(|d| d["id"].as_str().unwrap()).collect();
    // Back cameras sort ahead of front ones.
    assert_eq!(ids, vec!["synthetic-back", "synthetic-front"]);

    let response = call(&host, json!({"method": "listDevices", "mediaType": "audio"})).await;
    assert_eq!(response["ok"]["devices"][0]["id"], "synthetic-mic");

    let response = call(
        &host,
        json!({"method": "listFormats", "deviceId": "synthetic-front"}),
    )
    .await;
    let formats = response["ok"]["formats"].as_array().unwrap();
    assert_eq!(formats.len(), 3);

    let response = call(&host, json!({"method": "listFormats", "deviceId": "nope"})).await;
    assert_eq!(error_code(&response), "deviceUnavailable");
}

#[tokio::test]
async fn test_open_capture_close_round_trip() {
    let rig = rig();
    let host = CameraHost::new(rig.env.clone());

    let opened = call(
        &host,
        json!({
            "method": "open",
            "deviceId": "synthetic-back",
            "settings": {"resolutionPreset": "low", "imageFormat": "png"}
        }),
    )
    .await;
    assert_eq!(opened["ok"]["type"], "opened", "{opened}");
    assert_eq!(opened["ok"]["device"]["id"], "synthetic-back");
    assert_eq!(opened["ok"]["format"]["format"]["resolution"]["width"], 352);
    assert_eq!(opened["ok"]["maxZoom"], 8.0);
    let camera_id = opened["ok"]["cameraId"].as_u64().unwrap();
    assert_eq!(host.open_cameras().await, vec![CameraId(camera_id)]);

    let response = call(
        &host,
        json!({"method": "setZoomLevel", "cameraId": camera_id, "zoom": 2.0}),
    )
    .await;
    assert_eq!(response["ok"]["type"], "done");

    let response = call(&host, json!({"method": "takePicture", "cameraId": camera_id})).await;
    assert_eq!(response["ok"]["type"], "photoSaved", "{response}");
    let path = response["ok"]["path"].as_str().unwrap();
    assert!(path.ends_with(".png"));
    assert!(std::path::Path::new(path).exists());

    let response = call(&host, json!({"method": "close", "cameraId": camera_id})).await;
    assert_eq!(response["ok"]["type"], "done");
    assert!(host.open_cameras().await.is_empty());

    // The id is gone for good.
    let response = call(&host, json!({"method": "takePicture", "cameraId": camera_id})).await;
    assert_eq!(error_code(&response), "invalidSessionState");
}

#[tokio::test]
async fn test_camera_ids_are_not_reused() {
    let rig = rig();
    let host = CameraHost::new(rig.env.clone());
    let open = json!({"method": "open", "deviceId": "synthetic-front", "settings": {"resolutionPreset": "low"}});

    let first = call(&host, open.clone()).await["ok"]["cameraId"]
        .as_u64()
        .unwrap();
    call(&host, json!({"method": "close", "cameraId": first})).await;
    let second = call(&host, open).await["ok"]["cameraId"].as_u64().unwrap();
    assert_ne!(first, second);
    host.close_all().await;
    assert!(host.open_cameras().await.is_empty());
}

#[tokio::test]
async fn test_errors_carry_stable_codes() {
    let rig = rig();
    let host = CameraHost::new(rig.env.clone());

    let response = host.handle_json("{not json").await;
    assert_eq!(error_code(&response), "invalidRequest");

    let response = call(&host, json!({"method": "selfDestruct"})).await;
    assert_eq!(error_code(&response), "invalidRequest");

    let response = call(&host, json!({"method": "startPreview", "cameraId": 99})).await;
    assert_eq!(error_code(&response), "invalidSessionState");
    assert!(response["error"]["message"].as_str().unwrap().contains("99"));

    let response = call(
        &host,
        json!({"method": "open", "deviceId": "synthetic-front", "settings": {"resolutionPreset": "ultraHigh"}}),
    )
    .await;
    assert_eq!(error_code(&response), "configurationNotSupported");
}

#[tokio::test]
async fn test_permission_requests() {
    let permissions =
        FixedPermissions::with_status(MediaType::Video, PermissionStatus::NotDetermined);
    permissions.set_response(MediaType::Video, true);
    let rig = rig_with(permissions, |_| {});
    let host = CameraHost::new(rig.env.clone());

    let response = host
        .handle(HostRequest::PermissionStatus {
            media_type: MediaType::Video,
        })
        .await
        .unwrap();
    assert_eq!(
        response,
        HostResponse::Permission {
            status: PermissionStatus::NotDetermined
        }
    );

    let response = call(&host, json!({"method": "requestPermission"})).await;
    assert_eq!(response["ok"]["status"], "authorized");
    assert_eq!(rig.permissions.request_count(), 1);

    // Already decided: no second prompt.
    call(&host, json!({"method": "requestPermission"})).await;
    assert_eq!(rig.permissions.request_count(), 1);
}

#[tokio::test]
async fn test_denied_open_over_host() {
    let rig = rig_with(
        FixedPermissions::with_status(MediaType::Video, PermissionStatus::Denied),
        |_| {},
    );
    let host = CameraHost::new(rig.env.clone());

    let response = call(&host, json!({"method": "open", "deviceId": "synthetic-back"})).await;
    assert_eq!(error_code(&response), "permissionDenied");
    assert!(host.open_cameras().await.is_empty());
}

#[tokio::test]
async fn test_preview_events_over_host() {
    let rig = rig().unpaced();
    let host = CameraHost::new(rig.env.clone());

    let opened = call(
        &host,
        json!({"method": "open", "deviceId": "synthetic-back", "settings": {"resolutionPreset": "low"}}),
    )
    .await;
    let id = CameraId(opened["ok"]["cameraId"].as_u64().unwrap());
    let events = host.events(id).await.unwrap();

    host.handle(HostRequest::StartPreview { camera_id: id })
        .await
        .unwrap();
    let event = events
        .wait_for_event_timeout(Duration::from_secs(2))
        .await
        .expect("event");
    let event = serde_json::to_value(event).unwrap();
    assert_eq!(event["event"], "frameAvailable");
    assert_eq!(event["width"], 352);

    host.handle(HostRequest::PausePreview { camera_id: id })
        .await
        .unwrap();
    host.handle(HostRequest::ResumePreview { camera_id: id })
        .await
        .unwrap();
    host.handle(HostRequest::StopPreview { camera_id: id })
        .await
        .unwrap();
    host.close_all().await;
}

#[test]
fn test_host_usable_from_blocking_code() {
    let rig = rig();
    let host = CameraHost::new(rig.env.clone());

    let response = tokio_test::block_on(host.handle(HostRequest::ListDevices {
        media_type: MediaType::Video,
    }));
    let response = tokio_test::assert_ok!(response);
    match response {
        HostResponse::Devices { devices } => assert_eq!(devices.len(), 2),
        other => panic!("unexpected response {other:?}"),
    }
}
