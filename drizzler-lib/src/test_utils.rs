//! Helpers shared by unit and integration tests. Not part of the public
//! API surface.

/// Start a wiremock server answering GET requests with the given status.
///
/// Extra `wiremock::ResponseTemplate` method calls can be appended, e.g.
/// `mock_server!(StatusCode::OK, set_delay(Duration::from_millis(10)))`.
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let template = wiremock::ResponseTemplate::new($status);
        let template = template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(template)
            .mount(&mock_server)
            .await;
        mock_server
    }};
}
