use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;
use userscript_bridge::bridge::{CommandName, Envelope, HostInvoker, Mode};
use userscript_bridge::inject::{DataKey, ErrorSink, Injector, ScriptError};
use userscript_bridge::js::{QuickJsEngine, QuickJsUserscript};

#[test]
fn quickjs_executes_inline_script() {
    let engine = QuickJsEngine::new().expect("engine");
    let result: i32 = engine
        .eval_with(
            "(() => { console.log('hello from test'); return 40 + 2; })()",
            "quickjs_runtime_test.js",
        )
        .expect("script result");
    assert_eq!(result, 42);

    let has_window: bool = engine
        .eval_with("typeof window === 'object' && window === self", "globals.js")
        .expect("globals");
    assert!(has_window);
}

#[test]
fn quickjs_reports_thrown_errors() {
    let engine = QuickJsEngine::new().expect("engine");
    let err = engine
        .eval("throw new Error('kaput')", "throws.js")
        .expect_err("script throws");
    assert!(err.to_string().contains("kaput"));
}

struct Page {
    injector: Injector,
    outbound: Rc<RefCell<Vec<Envelope>>>,
    errors: Rc<RefCell<Vec<(String, ScriptError)>>>,
}

fn content_page() -> Page {
    let outbound = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&outbound);
    let invoker: HostInvoker =
        Rc::new(move |envelope: Envelope, _: Mode| sink.borrow_mut().push(envelope));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&errors);
    let error_sink: ErrorSink = Rc::new(move |script: &str, err: &ScriptError| {
        seen.borrow_mut().push((script.to_string(), err.clone()))
    });

    let injector = Injector::builder("web", "content")
        .host_invoker(invoker)
        .error_sink(error_sink)
        .initialize()
        .expect("injector");
    Page {
        injector,
        outbound,
        errors,
    }
}

fn deliver(page: &Page, batch: serde_json::Value) {
    let guest = page.injector.guest_invoker().expect("content mode");
    guest(Envelope::new(CommandName::ScriptData, batch));
}

#[test]
fn userscript_uses_gm_values_through_its_capability() {
    let page = content_page();
    deliver(
        &page,
        json!({
            "info": {"isFirefox": false, "ua": "QuickJS"},
            "items": [{
                "id": 4,
                "dataKey": "counter",
                "meta": {"name": "Counter", "namespace": "demo"},
                "values": {"count": 2}
            }]
        }),
    );

    let engine = Rc::new(QuickJsEngine::new().expect("engine"));
    let source = r#"
        const count = GM_getValue('count', 0);
        GM_setValue('count', count + 1);
        GM_setValue('owner', GM_info.script.name + '@' + GM_info.userAgent);
        GM_deleteValue('missing');
        if (this.GM_listValues().length !== 2) {
            throw new Error('unexpected keys');
        }
    "#;
    page.injector.assign_global(
        &DataKey::new("counter"),
        QuickJsUserscript::new(engine, source, "counter.user.js").boxed(),
    );

    assert!(page.errors.borrow().is_empty(), "{:?}", page.errors.borrow());
    let state = page.injector.state();
    assert_eq!(state.value(&"4".into(), "count"), Some(json!(3)));
    assert_eq!(state.value(&"4".into(), "owner"), Some(json!("Counter@QuickJS")));

    let updates: Vec<_> = page
        .outbound
        .borrow()
        .iter()
        .filter(|envelope| envelope.command_name() == Some(CommandName::UpdateValue))
        .map(|envelope| envelope.payload["key"].clone())
        .collect();
    assert_eq!(updates, vec![json!("count"), json!("owner")]);
}

#[test]
fn thrown_exception_is_logged_once_and_sibling_still_runs() {
    let page = content_page();
    deliver(
        &page,
        json!({
            "items": [
                {"id": 1, "dataKey": "broken", "meta": {"name": "Broken"}},
                {"id": 2, "dataKey": "fine", "meta": {"name": "Fine"}}
            ]
        }),
    );

    let engine = Rc::new(QuickJsEngine::new().expect("engine"));
    page.injector.assign_global(
        &DataKey::new("broken"),
        QuickJsUserscript::new(Rc::clone(&engine), "null.boom();", "broken.user.js").boxed(),
    );
    page.injector.assign_global(
        &DataKey::new("fine"),
        QuickJsUserscript::new(engine, "GM_setValue('ran', true);", "fine.user.js").boxed(),
    );

    let errors = page.errors.borrow();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "Broken");
    assert!(matches!(errors[0].1, ScriptError::Thrown(_)));
    assert_eq!(page.injector.state().value(&"2".into(), "ran"), Some(json!(true)));
}

#[test]
fn log_error_argument_reports_through_the_sink() {
    let page = content_page();
    deliver(
        &page,
        json!({ "items": [{"id": 1, "dataKey": "k", "custom": {"name": "Custom"}}] }),
    );

    let engine = Rc::new(QuickJsEngine::new().expect("engine"));
    page.injector.assign_global(
        &DataKey::new("k"),
        QuickJsUserscript::new(engine, "logError(new Error('later'));", "k.user.js").boxed(),
    );

    assert_eq!(
        *page.errors.borrow(),
        vec![("Custom".to_string(), ScriptError::Reported("later".into()))]
    );
}

#[test]
fn rejected_promise_from_body_reaches_the_logger() {
    let page = content_page();
    deliver(
        &page,
        json!({
            "items": [
                {"id": 1, "dataKey": "late", "meta": {"name": "Late"}},
                {"id": 2, "dataKey": "settled", "meta": {"name": "Settled"}}
            ]
        }),
    );

    let engine = Rc::new(QuickJsEngine::new().expect("engine"));
    page.injector.assign_global(
        &DataKey::new("late"),
        QuickJsUserscript::new(
            Rc::clone(&engine),
            "return Promise.resolve().then(() => { throw new Error('late failure'); });",
            "late.user.js",
        )
        .boxed(),
    );
    page.injector.assign_global(
        &DataKey::new("settled"),
        QuickJsUserscript::new(engine, "return Promise.resolve(1);", "settled.user.js").boxed(),
    );

    assert_eq!(
        *page.errors.borrow(),
        vec![("Late".to_string(), ScriptError::Reported("late failure".into()))]
    );
}
