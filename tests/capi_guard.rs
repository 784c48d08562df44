//! ホストAPIのガードテスト
//!
//! 破棄済み・解放済みストリーム、プラグイン呼び出し外、フェーズ違いの
//! 各ケースでアクセサが型付きステータスを返し、ホスト状態に触れないことを
//! 検証します。

mod common;

use std::thread;

use common::*;
use veil_dso::dso::{BufferAction, CapiStatus, HeaderAction, HttpRequest, PluginStatus, StringValue};
use veil_dso::http::{capi, Buffer, LocalReply, Phase};

fn running() -> Harness {
    let h = Harness::new(ScriptedPlugin::new(&[PluginStatus::Running]));
    h.filter.decode_headers(request_headers(), false);
    h
}

// ====================
// ライフタイム
// ====================

#[test]
fn test_accessors_after_destroy() {
    let h = running();
    let req = h.plugin.last_request();
    h.filter.on_destroy();

    assert_eq!(capi::get_header(&req, "host"), Err(CapiStatus::FilterDestroyed));
    assert_eq!(capi::set_header(&req, "x", "1", HeaderAction::Set), CapiStatus::FilterDestroyed);
    assert_eq!(capi::remove_header(&req, "host"), CapiStatus::FilterDestroyed);
    assert_eq!(capi::http_continue(&req, PluginStatus::Continue.as_raw()), CapiStatus::FilterDestroyed);
    assert_eq!(
        capi::send_local_reply(&req, LocalReply::new(403, "", "denied")),
        CapiStatus::FilterDestroyed
    );
    assert_eq!(capi::buffer_len(&req, 1), Err(CapiStatus::FilterDestroyed));
    assert_eq!(capi::get_string_value(&req, StringValue::RouteName as u64), Err(CapiStatus::FilterDestroyed));

    assert_eq!(h.run_pending(), 0);
    let log = h.host.log();
    assert_eq!(log.route_cache_cleared, 0);
    assert!(log.decoder_replies.is_empty());
}

#[test]
fn test_finalize_after_destroy_is_accepted() {
    let h = running();
    let req = h.plugin.last_request();
    h.filter.on_destroy();
    assert_eq!(capi::finalize(&req, 0), CapiStatus::Ok);
}

#[test]
fn test_accessors_after_stream_dropped() {
    let h = running();
    let req = h.plugin.last_request();
    let Harness { filter, .. } = h;
    drop(filter);

    assert_eq!(capi::get_header(&req, "host"), Err(CapiStatus::FilterGone));
    assert_eq!(capi::http_continue(&req, PluginStatus::Continue.as_raw()), CapiStatus::FilterGone);
    assert_eq!(capi::finalize(&req, 0), CapiStatus::FilterGone);
}

#[test]
fn test_continue_posted_then_stream_dropped() {
    let h = running();
    let req = h.plugin.last_request();
    assert!(capi::http_continue(&req, PluginStatus::Continue.as_raw()).is_ok());

    let Harness { filter, host, .. } = h;
    drop(filter);
    // 投稿済みタスクは弱参照のみを持つので何もしない
    assert_eq!(host.dispatcher.run_pending(), 1);
    assert_eq!(host.log().continue_decoding, 0);
}

// ====================
// 呼び出し外・フェーズ違い
// ====================

#[test]
fn test_not_in_plugin_after_call_returned() {
    let h = Harness::new(ScriptedPlugin::new(&[PluginStatus::Continue]));
    h.filter.decode_headers(request_headers(), false);
    let req = h.plugin.last_request();

    assert_eq!(capi::get_header(&req, "host"), Err(CapiStatus::NotInPlugin));
    assert_eq!(capi::set_header(&req, "x", "1", HeaderAction::Add), CapiStatus::NotInPlugin);
    assert_eq!(capi::http_continue(&req, PluginStatus::Continue.as_raw()), CapiStatus::NotInPlugin);
}

#[test]
fn test_invalid_phase() {
    let h = running();
    let req = h.plugin.last_request();

    let data_phase = HttpRequest {
        phase: Phase::DecodeData.as_raw(),
        ..req
    };
    assert_eq!(capi::get_header(&data_phase, "host"), Err(CapiStatus::InvalidPhase));

    let no_direction = HttpRequest { phase: 0, ..req };
    assert_eq!(capi::get_header(&no_direction, "host"), Err(CapiStatus::InvalidPhase));

    let out_of_range = HttpRequest { phase: 99, ..req };
    assert_eq!(capi::http_continue(&out_of_range, 2), CapiStatus::InvalidPhase);

    // ヘッダ呼び出し中に buffer や trailer は読めない
    assert_eq!(capi::buffer_len(&req, 1), Err(CapiStatus::InvalidPhase));
    assert_eq!(capi::get_trailer(&req, "x"), Err(CapiStatus::InvalidPhase));
}

#[test]
fn test_stale_buffer_id() {
    let plugin = ScriptedPlugin::new(&[]).with_hook(|req, event| {
        if let PluginEvent::Data { .. } = event {
            assert_eq!(capi::buffer_len(req, 7), Err(CapiStatus::InvalidPhase));
            assert_eq!(
                capi::set_buffer(req, 7, b"x", BufferAction::Set),
                CapiStatus::InvalidPhase
            );
            let mut wrong = [0u8; 2];
            assert_eq!(capi::get_buffer(req, 1, &mut wrong), CapiStatus::BadArgument);
        }
    });
    let h = Harness::new(plugin);
    h.filter.decode_headers(request_headers(), false);
    let mut data = Buffer::from_slice(b"abc");
    h.filter.decode_data(&mut data, true);
    assert_eq!(data.as_slice(), b"abc");
}

// ====================
// 値の取得と Yield
// ====================

#[test]
fn test_string_value_on_loop() {
    let h = running();
    let req = h.plugin.last_request();

    assert_eq!(
        capi::get_string_value(&req, StringValue::RouteName as u64),
        Ok(Some("default-route".to_string()))
    );
    assert_eq!(
        capi::get_string_value(&req, StringValue::Protocol as u64),
        Ok(Some("HTTP/1.1".to_string()))
    );
    assert_eq!(capi::get_string_value(&req, StringValue::ResponseCode as u64), Ok(None));
    assert_eq!(capi::get_string_value(&req, 42), Err(CapiStatus::BadArgument));
}

#[test]
fn test_string_value_off_loop_yields() {
    let h = running();
    let req = h.plugin.last_request();
    let id = StringValue::RouteName as u64;

    let first = thread::spawn(move || capi::get_string_value(&req, id)).join().unwrap();
    assert_eq!(first, Err(CapiStatus::Yield));
    // 取得前の再呼び出しも Yield
    let again = thread::spawn(move || capi::get_string_value(&req, id)).join().unwrap();
    assert_eq!(again, Err(CapiStatus::Yield));

    assert_eq!(h.run_pending(), 1);
    assert!(h.plugin.events().contains(&PluginEvent::YieldReady));

    let ready = thread::spawn(move || capi::get_string_value(&req, id)).join().unwrap();
    assert_eq!(ready, Ok(Some("default-route".to_string())));
}

#[test]
fn test_dynamic_metadata() {
    let h = running();
    let req = h.plugin.last_request();

    assert!(capi::set_dynamic_metadata(&req, "veil.dso", "user", "alice").is_ok());
    assert_eq!(
        capi::get_dynamic_metadata(&req, "veil.dso", "user"),
        Ok(Some("alice".to_string()))
    );

    let code = thread::spawn(move || capi::set_dynamic_metadata(&req, "veil.dso", "role", "admin"))
        .join()
        .unwrap();
    assert!(code.is_ok());
    assert_eq!(capi::get_dynamic_metadata(&req, "veil.dso", "role"), Ok(None));
    h.run_pending();
    assert_eq!(
        capi::get_dynamic_metadata(&req, "veil.dso", "role"),
        Ok(Some("admin".to_string()))
    );
    assert!(h.host.all_on_loop());
}
