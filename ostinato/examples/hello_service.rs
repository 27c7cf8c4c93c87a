// A small REST service: curl it with
//   curl http://127.0.0.1:8080/v1/hello
//   curl http://127.0.0.1:8080/v1/items/42
//   curl http://127.0.0.1:8080/help

use ostinato::{
    MatchResult, Reactor, ReactorConfig, RestConnection, RestServiceEndpoint, Router, logging, on,
    rx,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let mut router = Router::new();
    let v1 = router.add_sub_router("/v1", "version 1 API");
    v1.add_route(
        "/hello",
        "GET",
        "say hello",
        on(|conn, _req, _ctx| {
            let _ = conn.send_response(200, b"hello, world\n", "text/plain");
            MatchResult::Matched
        }),
    );
    v1.add_route(
        rx("/items/([0-9]+)", "/items/<id>"),
        "GET",
        "fetch one item by numeric id",
        on(|conn, _req, ctx| {
            let id = ctx.resources.last().cloned().unwrap_or_default();
            let body = format!("{{\"item\":{}}}\n", id);
            let _ = conn.send_response(200, body.as_bytes(), "application/json");
            MatchResult::Matched
        }),
    );
    router.add_help_route("/help", "GET");

    let reactor = Reactor::new(ReactorConfig::default().threads(0).name("hello"))?;
    let endpoint = RestServiceEndpoint::new(&reactor, router);
    endpoint.bind("0.0.0.0", 8080)?;
    endpoint.serve_forever();
    Ok(())
}
