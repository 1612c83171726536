//! 路由表：每条路由声明自己的守卫列表。

use axum::extract::{DefaultBodyLimit, Extension, Request};
use axum::middleware::{self, Next};
use axum::routing::{MethodRouter, get, post};
use axum::Router;
use std::sync::Arc;

use crate::auth::{AccessGate, BROWSER_GUARDS, Guard, UPLOAD_GUARDS, enforce};
use crate::error;
use crate::files;
use crate::frontend;
use crate::http::add_security_headers;
use crate::storage::Storage;
use crate::upload::{self, UploadPolicy};

/// 在处理器之前按顺序执行 `guards`。
fn guarded(route: MethodRouter, guards: &'static [Guard]) -> MethodRouter {
    route.route_layer(middleware::from_fn(move |req: Request, next: Next| {
        enforce(guards, req, next)
    }))
}

/// 构建完整的应用路由。
pub fn build_router(
    storage: Arc<Storage>,
    gate: Arc<AccessGate>,
    policy: Arc<UploadPolicy>,
) -> Router {
    let body_limit = policy.body_limit();
    Router::new()
        .route("/", guarded(get(frontend::index), BROWSER_GUARDS))
        .route(
            "/upload",
            guarded(post(upload::upload_file), UPLOAD_GUARDS)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/files", guarded(get(files::list_files), BROWSER_GUARDS))
        .route(
            "/files/{*name}",
            guarded(get(files::download_file), BROWSER_GUARDS),
        )
        .route(
            "/delete/{*name}",
            guarded(post(files::delete_file), BROWSER_GUARDS),
        )
        .route(
            "/delete_all",
            guarded(post(files::delete_all_files), BROWSER_GUARDS),
        )
        .route("/ping", get(files::ping))
        .fallback(error::not_found)
        .layer(middleware::from_fn(add_security_headers))
        .layer(Extension(storage))
        .layer(Extension(gate))
        .layer(Extension(policy))
}
