//! Minimal trellis example: simple handlers, a builder handler, a sub-router
//! and static files.
//!
//! Run with:
//!   RUST_LOG=info TRELLIS_HTDOCS=./public cargo run --example basic
//!
//! Try:
//!   curl http://localhost:8080/
//!   curl 'http://localhost:8080/hello?name=alice'
//!   curl -X POST http://localhost:8080/api -d '{"value1":1,"value2":2}'
//!   curl http://localhost:8080/build
//!   curl http://localhost:8080/router2/test
//!   curl http://localhost:8080/index.html      # served from TRELLIS_HTDOCS

use serde::Deserialize;
use trellis::http::{Method, StatusCode};
use trellis::{Config, Error, Request, Response, Router, Server};

#[derive(Deserialize)]
struct Pair {
    value1: i64,
    value2: i64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let mut app = Router::new();
    app.get("/", |_req, _res| "Hello world!")?
        .get("/hello", hello)?
        .post("/api", sum)?
        .builder(Method::GET, "/build", |_req, mut res, begin| async move {
            begin.await;
            res.flush_header().await?;
            for word in ["Hello", " ", "world", "!"] {
                res.flush_body(word).await?;
            }
            res.flush_end().await
        })?;

    app.new_sub_router("router2")?
        .get("/test", |_req, _res| "Hello router2!")?;

    Server::new(Config::from_env()).serve(app).await
}

// GET /hello?name=…
fn hello(req: &Request, _res: &mut Response) -> String {
    format!("Hello {}!", req.query("name").unwrap_or("world"))
}

// POST /api with a JSON body; 400 when it does not parse.
fn sum(req: &Request, res: &mut Response) -> String {
    match req.json::<Pair>() {
        Some(pair) => format!("{}", pair.value1 + pair.value2),
        None => {
            res.set_status(StatusCode::BAD_REQUEST).ok();
            "Bad request!".to_owned()
        }
    }
}
