use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;

fn problem(status: StatusCode, title: &str, detail: &str) -> Response {
    (
        status,
        Json(json!({
            "type": "about:blank",
            "title": title,
            "status": status.as_u16(),
            "detail": detail,
        })),
    )
        .into_response()
}

pub fn bad_request(detail: &str) -> Response {
    problem(StatusCode::BAD_REQUEST, "Bad Request", detail)
}

pub fn not_found(detail: &str) -> Response {
    problem(StatusCode::NOT_FOUND, "Not Found", detail)
}

pub fn payload_too_large(detail: &str) -> Response {
    problem(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large", detail)
}

pub fn service_unavailable(detail: &str) -> Response {
    problem(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable", detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_bodies_carry_the_status_code() {
        let resp = not_found("no such session");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = payload_too_large("too big");
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let resp = service_unavailable("source unavailable");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
