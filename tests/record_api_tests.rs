mod common;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use common::{spawn_test_server, test_config};

async fn spawn_shop() -> String {
    spawn_test_server(test_config(json!({
        "models": [
            {"name": "Customer", "required": ["name"]},
            {"name": "Order", "references": {"customer": "Customer"}, "defaults": {"status": "new"}}
        ]
    })))
    .await
}

async fn create(client: &Client, base: &str, model: &str, data: Value) -> reqwest::Response {
    client
        .post(format!("{}/api/v1/records/{}", base, model))
        .json(&json!({ "data": data }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn create_list_and_query_records() {
    let base = spawn_shop().await;
    let client = Client::new();

    let resp = create(&client, &base, "Customer", json!({"_id": "c1", "name": "Ada", "tier": 2})).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["record"]["name"], "Ada");
    assert!(created["record"]["createdAt"].is_i64());

    create(&client, &base, "Customer", json!({"_id": "c2", "name": "Bob", "tier": 1})).await;
    create(&client, &base, "Customer", json!({"_id": "c3", "name": "Cy", "tier": 3})).await;

    let all: Value = client
        .get(format!("{}/api/v1/records/Customer", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all["count"], 3);
    // lean results carry no `id` virtual
    assert!(all["records"][0].get("id").is_none());

    let queried: Value = client
        .post(format!("{}/api/v1/records/Customer/query", base))
        .json(&json!({
            "criteria": {"tier": {"$gte": 2}},
            "projection": "name -_id",
            "sort": {"tier": -1}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        queried["records"],
        json!([{"name": "Cy"}, {"name": "Ada"}])
    );
}

#[tokio::test]
async fn update_record_returns_post_update_state() {
    let base = spawn_shop().await;
    let client = Client::new();
    create(&client, &base, "Customer", json!({"_id": "c1", "name": "Ada", "visits": 1})).await;

    let resp = client
        .patch(format!("{}/api/v1/records/Customer/c1", base))
        .json(&json!({"data": {"$inc": {"visits": 2}, "name": "Ada L."}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["record"]["visits"], 3);
    assert_eq!(body["record"]["name"], "Ada L.");
    assert!(body["record"]["updatedAt"].as_i64().unwrap() >= body["record"]["createdAt"].as_i64().unwrap());

    let missing = client
        .patch(format!("{}/api/v1/records/Customer/nobody", base))
        .json(&json!({"data": {"name": "x"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_record_then_missing() {
    let base = spawn_shop().await;
    let client = Client::new();
    create(&client, &base, "Customer", json!({"_id": "c1", "name": "Ada"})).await;

    let resp = client
        .delete(format!("{}/api/v1/records/Customer/c1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["record"]["_id"], "c1");

    let again = client
        .delete(format!("{}/api/v1/records/Customer/c1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn store_errors_map_to_http_status() {
    let base = spawn_shop().await;
    let client = Client::new();

    let unknown = client
        .get(format!("{}/api/v1/records/Ghost", base))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let invalid = create(&client, &base, "Customer", json!({"tier": 1})).await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    let body: Value = invalid.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("name"));

    create(&client, &base, "Customer", json!({"_id": "c1", "name": "Ada"})).await;
    let duplicate = create(&client, &base, "Customer", json!({"_id": "c1", "name": "Ada"})).await;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let bad_query = client
        .post(format!("{}/api/v1/records/Customer/query", base))
        .json(&json!({"criteria": {"name": {"$like": "A%"}}}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_query.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn populate_and_aggregate_orders() {
    let base = spawn_shop().await;
    let client = Client::new();
    create(&client, &base, "Customer", json!({"_id": "c1", "name": "Ada"})).await;
    create(&client, &base, "Order", json!({"customer": "c1", "total": 30})).await;
    create(&client, &base, "Order", json!({"customer": "c1", "total": 12, "status": "paid"})).await;

    let populated: Value = client
        .post(format!("{}/api/v1/records/Order/populate", base))
        .json(&json!({
            "criteria": {"status": "new"},
            "populate": {"path": "customer", "select": "name"}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(populated["count"], 1);
    assert_eq!(
        populated["records"][0]["customer"],
        json!({"_id": "c1", "name": "Ada"})
    );

    let totals: Value = client
        .post(format!("{}/api/v1/records/Order/aggregate", base))
        .json(&json!({"pipeline": [
            {"$group": {"_id": "$status", "sum": {"$sum": "$total"}}},
            {"$sort": {"_id": 1}}
        ]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        totals["records"],
        json!([{"_id": "new", "sum": 30}, {"_id": "paid", "sum": 12}])
    );
}
