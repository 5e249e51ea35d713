use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::LocalSet;
use userscript_bridge::bridge::{Bridge, BridgeError, CommandName, Envelope, Mode, PageEvents, Responder};
use userscript_bridge::inject::{DataKey, Injector};

fn page_injector(events: &PageEvents, page_id: &str, content_id: &str) -> Injector {
    Injector::builder(page_id, content_id)
        .page_events(events.clone())
        .initialize()
        .expect("page injector")
}

fn counter_for(bridge: &Bridge, command: CommandName) -> Rc<RefCell<Vec<Value>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    bridge.add_handler(command, move |payload, _| sink.borrow_mut().push(payload));
    seen
}

#[test]
fn page_mode_requires_an_event_bus() {
    let err = Injector::builder("web", "content").initialize().err();
    assert!(matches!(err, Some(BridgeError::MissingPageEvents)));
}

#[test]
fn ping_is_answered_with_pong_on_the_matching_pair_only() {
    let events = PageEvents::new();
    let first = page_injector(&events, "web-a", "content-a");
    let second = page_injector(&events, "web-b", "content-b");
    assert_eq!(first.mode(), Mode::Page);
    assert!(first.guest_invoker().is_none());

    let content_a = Bridge::over_page_events(Mode::Content, &events, "content-a", "web-a");
    let content_b = Bridge::over_page_events(Mode::Content, &events, "content-b", "web-b");
    let pongs_a = counter_for(&content_a, CommandName::Pong);
    let pongs_b = counter_for(&content_b, CommandName::Pong);

    content_a.post(CommandName::Ping, Value::Null);
    assert_eq!(pongs_a.borrow().len(), 1);
    assert!(pongs_b.borrow().is_empty());

    drop((first, second));
}

#[tokio::test]
async fn send_resolves_with_exact_reply_and_forgets_the_id() {
    LocalSet::new()
        .run_until(async {
            let events = PageEvents::new();
            let page = Bridge::over_page_events(Mode::Page, &events, "web", "content");
            let content = Bridge::over_page_events(Mode::Content, &events, "content", "web");

            let last_id: Rc<RefCell<Option<String>>> = Rc::default();
            let seen_id = Rc::clone(&last_id);
            content.add_handler(CommandName::CheckScript, move |payload, responder: Responder| {
                assert_eq!(payload, json!({"name": "n"}));
                assert!(responder.expects_reply());
                *seen_id.borrow_mut() = responder.callback_id().map(str::to_string);
                responder.reply(json!({"version": "2.1", "nested": [1, 2]}));
            });

            let reply = page
                .send(CommandName::CheckScript, json!({"name": "n"}))
                .await
                .expect("reply");
            assert_eq!(reply, json!({"version": "2.1", "nested": [1, 2]}));
            assert_eq!(page.pending_callbacks(), 0);

            // A repeated delivery for the same id is ignored.
            let id = last_id.borrow().clone().expect("callback id");
            content.post(CommandName::Callback, json!({"callbackId": id, "payload": "again"}));
            assert_eq!(page.pending_callbacks(), 0);
        })
        .await;
}

#[tokio::test]
async fn pending_send_does_not_block_other_messages() {
    LocalSet::new()
        .run_until(async {
            let events = PageEvents::new();
            let page = Bridge::over_page_events(Mode::Page, &events, "web", "content");
            let content = Bridge::over_page_events(Mode::Content, &events, "content", "web");

            let parked: Rc<RefCell<Option<Responder>>> = Rc::default();
            let park = Rc::clone(&parked);
            content.add_handler(CommandName::CheckScript, move |_, responder| {
                *park.borrow_mut() = Some(responder);
            });
            let commands = counter_for(&page, CommandName::Command);

            let request = tokio::task::spawn_local(page.send(CommandName::CheckScript, Value::Null));
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(page.pending_callbacks(), 1);

            content.post(CommandName::Command, json!("menu"));
            assert_eq!(*commands.borrow(), vec![json!("menu")]);

            let responder = parked.borrow_mut().take().expect("parked responder");
            responder.reply(json!(7));
            assert_eq!(request.await.unwrap().unwrap(), json!(7));
        })
        .await;
}

#[tokio::test]
async fn dropped_bridge_fails_pending_send() {
    LocalSet::new()
        .run_until(async {
            let bridge = Bridge::new(Mode::Page);
            let sent = Rc::new(Cell::new(0));
            let counter = Rc::clone(&sent);
            bridge.connect(Rc::new(move |_: Envelope| counter.set(counter.get() + 1)));

            let reply = bridge.send(CommandName::CheckScript, Value::Null);
            assert_eq!(sent.get(), 1);
            drop(bridge);
            assert!(matches!(reply.await, Err(BridgeError::ReplyDropped)));
        })
        .await;
}

#[test]
fn firefox_page_realm_announces_each_batch_once() {
    let events = PageEvents::new();
    let injector = page_injector(&events, "web", "content");
    let content = Bridge::over_page_events(Mode::Content, &events, "content", "web");
    let announced = counter_for(&content, CommandName::InjectList);

    content.post(
        CommandName::ScriptData,
        json!({
            "info": {"isFirefox": true, "ua": "Firefox"},
            "items": [{"id": 1, "dataKey": "a"}, {"id": 2, "dataKey": "b"}],
            "runAt": "start"
        }),
    );
    assert_eq!(*announced.borrow(), vec![json!("start")]);
    assert!(injector.has_global(&DataKey::new("a")));
    assert!(injector.has_global(&DataKey::new("b")));

    content.post(CommandName::ScriptData, json!({ "items": [] }));
    assert_eq!(*announced.borrow(), vec![json!("start"), Value::Null]);
}

#[test]
fn other_browsers_skip_the_announcement() {
    let events = PageEvents::new();
    let _injector = page_injector(&events, "web", "content");
    let content = Bridge::over_page_events(Mode::Content, &events, "content", "web");
    let announced = counter_for(&content, CommandName::InjectList);

    content.post(
        CommandName::ScriptData,
        json!({
            "info": {"isFirefox": false, "ua": "Chrome"},
            "items": [{"id": 1, "dataKey": "a"}],
            "runAt": "start"
        }),
    );
    assert!(announced.borrow().is_empty());
}
