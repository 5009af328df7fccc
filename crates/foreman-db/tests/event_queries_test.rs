//! Integration tests for the append-only event log.

use chrono::{Duration, Utc};
use uuid::Uuid;

use foreman_db::queries::events::{self as event_db, NewEvent};
use foreman_test_utils::{create_test_db, drop_test_db};

fn event(event_type: &str, entity_id: Uuid, at: chrono::DateTime<Utc>) -> NewEvent {
    NewEvent {
        event_type: event_type.to_owned(),
        entity_type: "ticket".to_owned(),
        entity_id,
        payload: serde_json::json!({ "schema_version": 1 }),
        recorded_at: at,
    }
}

#[tokio::test]
async fn append_and_list_in_order() {
    let (pool, db_name) = create_test_db().await;
    let entity = Uuid::new_v4();
    let base = Utc::now();

    event_db::insert_event(&pool, &event("phase.transitioned", entity, base))
        .await
        .unwrap();
    event_db::insert_event(
        &pool,
        &event("workflow.result.validated", entity, base + Duration::seconds(5)),
    )
    .await
    .unwrap();
    event_db::insert_event(
        &pool,
        &event("phase.transitioned", entity, base + Duration::seconds(10)),
    )
    .await
    .unwrap();

    let events = event_db::list_for_entity(&pool, "ticket", entity, 50).await.unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.windows(2).all(|w| w[0].recorded_at <= w[1].recorded_at));

    let limited = event_db::list_for_entity(&pool, "ticket", entity, 2).await.unwrap();
    assert_eq!(limited.len(), 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn latest_and_existence_queries() {
    let (pool, db_name) = create_test_db().await;
    let entity = Uuid::new_v4();
    let other = Uuid::new_v4();
    let base = Utc::now();

    event_db::insert_event(&pool, &event("diagnostic.stuck_detected", entity, base))
        .await
        .unwrap();
    event_db::insert_event(
        &pool,
        &event(
            "diagnostic.stuck_detected",
            entity,
            base + Duration::seconds(60),
        ),
    )
    .await
    .unwrap();

    let latest = event_db::latest_of_type(&pool, "diagnostic.stuck_detected", entity)
        .await
        .unwrap()
        .expect("latest event expected");
    assert_eq!(latest.recorded_at, base + Duration::seconds(60));

    assert!(
        event_db::has_event_of_type(&pool, "diagnostic.stuck_detected", entity)
            .await
            .unwrap()
    );
    assert!(
        !event_db::has_event_of_type(&pool, "workflow.result.validated", entity)
            .await
            .unwrap()
    );
    assert!(
        !event_db::has_event_of_type(&pool, "diagnostic.stuck_detected", other)
            .await
            .unwrap()
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}
