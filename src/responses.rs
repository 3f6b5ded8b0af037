use axum::{
    Json,
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize)]
pub struct RequestMeta {
    pub request_id: String,
    pub request_at: String, // RFC3339
    pub timestamp: i64,     // unix seconds
}

fn new_meta() -> RequestMeta {
    let now: DateTime<Utc> = Utc::now();
    RequestMeta {
        request_id: Uuid::new_v4().to_string(),
        request_at: now.to_rfc3339(),
        timestamp: now.timestamp(),
    }
}

// Middleware: attaches RequestMeta into request extensions
pub async fn meta_middleware(mut req: Request<Body>, next: Next) -> Response {
    let meta = new_meta();
    req.extensions_mut().insert(meta);
    next.run(req).await
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u32,
}

impl Pagination {
    /// Clamps the request to a 1-based page of at most 100 items.
    pub fn new(page: Option<u32>, per_page: Option<u32>, total: u64) -> Self {
        let per_page = per_page.unwrap_or(20).clamp(1, 100);
        let total_pages = total.div_ceil(per_page as u64) as u32;
        Self {
            page: page.unwrap_or(1).max(1),
            per_page,
            total,
            total_pages,
        }
    }

    /// Index range of the current page within the full result.
    pub fn offset(&self) -> usize {
        (self.page as usize - 1) * self.per_page as usize
    }

    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset())
            .take(self.per_page as usize)
            .collect()
    }
}

#[derive(Serialize)]
pub struct SuccessEnvelope<T> {
    pub message: String,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    pub meta: RequestMeta,
}

pub struct ApiOk<T> {
    status: StatusCode,
    body: SuccessEnvelope<T>,
}

impl<T> ApiOk<T> {
    pub fn ok(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self {
            status: StatusCode::OK,
            body: SuccessEnvelope {
                message: message.into(),
                data,
                pagination: None,
                meta,
            },
        }
    }

    pub fn created(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self {
            status: StatusCode::CREATED,
            ..Self::ok(message, data, meta)
        }
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.body.pagination = Some(pagination);
        self
    }
}

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_and_slices() {
        let p = Pagination::new(Some(2), Some(3), 7);
        assert_eq!(p.total_pages, 3);
        assert_eq!(p.slice((0..7).collect()), vec![3, 4, 5]);

        let p = Pagination::new(Some(0), Some(1_000), 0);
        assert_eq!((p.page, p.per_page, p.total_pages), (1, 100, 0));
        assert!(p.slice(Vec::<u8>::new()).is_empty());
    }
}
