use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde_json::json;

use decision_agent::{
    Attributes, DecisionFacade, Event, EventTags, InMemoryOverrideStore, RequestContext,
    StaticConfigSource, UserContext,
};

const DATAFILE: &[u8] = include_bytes!("data/datafile.json");

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn facade() -> (DecisionFacade, Arc<Mutex<Vec<Event>>>) {
    init();

    let events = Arc::new(Mutex::new(Vec::new()));
    let source = StaticConfigSource::from_datafile(DATAFILE).unwrap();
    let facade = DecisionFacade::with_bucketing_engine(
        Arc::new(source),
        Arc::new(InMemoryOverrideStore::new()),
        {
            let events = events.clone();
            move |event: Event| events.lock().unwrap().push(event)
        },
    );

    (facade, events)
}

fn pro_user(id: &str) -> UserContext {
    UserContext::with_attributes(id, Attributes::from([("plan".to_owned(), "pro".into())]))
}

#[tokio::test]
async fn user_outside_audience_gets_defaults() {
    let (facade, events) = facade();
    let ctx = RequestContext::background();

    let decision = facade
        .activate_feature(&ctx, "checkout_redesign", &UserContext::new("free-user"), true)
        .await
        .unwrap();

    assert!(!decision.enabled);
    assert_eq!(decision.experiment_key, "");
    assert_eq!(decision.variation_key, "");
    assert_eq!(
        decision.variables,
        HashMap::from([
            ("button_color".to_owned(), json!("blue")),
            ("discount".to_owned(), json!(0.0)),
            ("show_banner".to_owned(), json!(false)),
        ])
    );
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn override_switches_decision_and_variables() {
    let (facade, events) = facade();
    let ctx = RequestContext::background();
    let user = pro_user("pro-user");

    let bucketed = facade
        .activate_feature(&ctx, "checkout_redesign", &user, true)
        .await
        .unwrap();
    assert!(!bucketed.enabled);
    assert_eq!(bucketed.experiment_key, "checkout_test");
    assert_eq!(bucketed.variation_key, "control");
    assert_eq!(bucketed.variables["button_color"], json!("blue"));

    let set = facade
        .set_forced_variation(&ctx, "checkout_test", "pro-user", "treatment")
        .await
        .unwrap();
    assert!(set.messages.is_empty());

    let forced = facade
        .activate_feature(&ctx, "checkout_redesign", &user, true)
        .await
        .unwrap();
    assert!(forced.enabled);
    assert_eq!(forced.variation_key, "treatment");
    assert_eq!(forced.variables["button_color"], json!("green"));
    assert_eq!(forced.variables["discount"], json!(12.5));
    assert_eq!(forced.variables["show_banner"], json!(true));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|event| matches!(event, Event::Impression(_)) && event.user_id() == "pro-user"));
}

#[tokio::test]
async fn track_event_dispatches_conversion() {
    let (facade, events) = facade();
    let ctx = RequestContext::background();

    let track = facade
        .track_event(
            &ctx,
            "purchase",
            &pro_user("buyer"),
            &EventTags::from([("revenue".to_owned(), json!(4200))]),
        )
        .await
        .unwrap();
    assert_eq!(track.error, None);

    let events = events.lock().unwrap();
    let [Event::Conversion(conversion)] = events.as_slice() else {
        panic!("expected exactly one conversion, got {events:?}");
    };
    assert_eq!(conversion.event_key, "purchase");
    assert_eq!(conversion.tags["revenue"], json!(4200));
}

#[tokio::test]
async fn results_serialize_for_http_layer() {
    let (facade, _) = facade();
    let ctx = RequestContext::background();

    let decision = facade
        .activate_experiment(&ctx, "checkout_test", &pro_user("pro-user"), false)
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&decision).unwrap(),
        json!({
            "userId": "pro-user",
            "featureKey": "",
            "type": "experiment",
            "variables": {},
            "enabled": true,
            "experimentKey": "checkout_test",
            "variationKey": "control",
        })
    );

    let removed = facade
        .remove_forced_variation(&ctx, "checkout_test", "pro-user")
        .await
        .unwrap();
    assert_eq!(
        serde_json::to_value(&removed).unwrap(),
        json!({
            "userId": "pro-user",
            "experimentKey": "checkout_test",
            "variationKey": "",
            "prevVariationKey": "",
            "messages": ["no pre-existing override"],
        })
    );
}

#[test]
fn summary_skips_unparsable_entities() {
    let (facade, _) = facade();

    let summary = facade.config_summary().unwrap();
    assert_eq!(summary.revision, "42");
    assert!(summary.features.contains_key("checkout_redesign"));
    assert!(!summary.features.contains_key("unparsable"));
    assert_eq!(
        summary.experiments["checkout_test"].variation_keys,
        vec!["control".to_owned(), "treatment".to_owned()]
    );
}
