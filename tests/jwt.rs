//! Bearer-token gas over HTTP.

use airway::middleware::jwt::jwt;
use airway::{handler_fn, Engine, PathRouter};
use jsonwebtoken::{encode, EncodingKey, Header};

mod common;

const SECRET: &[u8] = b"integration-secret";

fn token(secret: &[u8]) -> String {
    let claims = serde_json::json!({ "sub": "alice", "exp": 4_102_444_800u64 });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
}

async fn start() -> (std::sync::Arc<airway::Server>, std::net::SocketAddr) {
    let mut router = PathRouter::new();
    router
        .get(
            "/me",
            handler_fn(|req, res| {
                Box::pin(async move {
                    let sub = req
                        .value("user")
                        .and_then(|claims| claims["sub"].as_str())
                        .unwrap_or("anonymous")
                        .to_string();
                    res.write_string(&sub);
                    Ok(())
                })
            }),
        )
        .unwrap();

    let engine = Engine::builder(common::test_config())
        .router(router)
        .gas(jwt(SECRET).unwrap())
        .build();
    common::start(engine).await
}

#[tokio::test]
async fn valid_token_reaches_handler_with_claims() {
    let (server, addr) = start().await;
    let res = common::client()
        .get(format!("http://{}/me", addr))
        .bearer_auth(token(SECRET))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "alice");
    server.close();
}

#[tokio::test]
async fn tampered_token_is_unauthorized() {
    let (server, addr) = start().await;
    let client = common::client();

    let mut tampered = token(SECRET);
    tampered.insert_str(tampered.len() - 2, "AA");
    let res = client
        .get(format!("http://{}/me", addr))
        .bearer_auth(tampered)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = client
        .get(format!("http://{}/me", addr))
        .bearer_auth(token(b"someone-else"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
    server.close();
}

#[tokio::test]
async fn missing_token_is_bad_request() {
    let (server, addr) = start().await;
    let client = common::client();

    let res = client.get(format!("http://{}/me", addr)).send().await.unwrap();
    assert_eq!(res.status(), 400);

    let res = client
        .get(format!("http://{}/me", addr))
        .header("Authorization", "Basic YWxpY2U6c2VjcmV0")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    server.close();
}
