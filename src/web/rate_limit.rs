//! # Rate Limit — Janela Fixa por IP
//!
//! Limites por classe de rota: consulta 30/min/IP, upload 100/min/IP.
//! Janela fixa de 60 s com contadores atrás de um lock — suficiente
//! para um processo único; estouro devolve 429 com corpo JSON estável.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use parking_lot::Mutex;

use crate::error::ApiError;
use crate::web::state::AppState;

const WINDOW: Duration = Duration::from_secs(60);
const QUERY_PER_MINUTE: u32 = 30;
const UPLOAD_PER_MINUTE: u32 = 100;

struct Window {
    started: Instant,
    count: u32,
}

/// Contadores de janela fixa, uma tabela por classe de rota.
pub struct RateLimiter {
    query: Mutex<HashMap<IpAddr, Window>>,
    upload: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            query: Mutex::new(HashMap::new()),
            upload: Mutex::new(HashMap::new()),
        }
    }

    fn allow(table: &Mutex<HashMap<IpAddr, Window>>, ip: IpAddr, limit: u32) -> bool {
        let mut table = table.lock();
        // Janelas velhas saem de cena para a tabela não crescer sem fim.
        table.retain(|_, w| w.started.elapsed() < WINDOW);
        let window = table.entry(ip).or_insert_with(|| Window {
            started: Instant::now(),
            count: 0,
        });
        if window.started.elapsed() >= WINDOW {
            window.started = Instant::now();
            window.count = 0;
        }
        window.count += 1;
        window.count <= limit
    }

    pub fn allow_query(&self, ip: IpAddr) -> bool {
        Self::allow(&self.query, ip, QUERY_PER_MINUTE)
    }

    pub fn allow_upload(&self, ip: IpAddr) -> bool {
        Self::allow(&self.upload, ip, UPLOAD_PER_MINUTE)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// IP do cliente via `ConnectInfo` (exige `into_make_service_with_connect_info`).
fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn limit_query(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.rate_limits.allow_query(client_ip(&req)) {
        return Err(ApiError::TooManyRequests);
    }
    Ok(next.run(req).await)
}

pub async fn limit_upload(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.rate_limits.allow_upload(client_ip(&req)) {
        return Err(ApiError::TooManyRequests);
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A janela de consulta bloqueia a partir da 31ª requisição.
    #[test]
    fn test_query_window() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..QUERY_PER_MINUTE {
            assert!(limiter.allow_query(ip));
        }
        assert!(!limiter.allow_query(ip));
        // Outro IP tem janela própria.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.allow_query(other));
    }
}
