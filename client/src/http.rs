//! Transporte HTTP JSON hacia el master, con mutaciones idempotentes.

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
    Client, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tm_common::{ErrorKind, HttpConfig, MutationParams, Result, RetryEngine, TmError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const PARAMETERS_HEADER: &str = "X-TM-Parameters";
pub const CLIENT_NAME: &str = concat!("tm-client ", env!("CARGO_PKG_VERSION"));

const MASK: &str = "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx";

/// Cabeceras en texto con el token sustituido por `x`*32.
pub fn mask_headers(headers: &HeaderMap, token: Option<&str>) -> String {
    headers
        .iter()
        .map(|(name, value)| {
            let value = value.to_str().unwrap_or("<binary>");
            let value = match token {
                Some(token) if !token.is_empty() => value.replace(token, MASK),
                _ => value.to_string(),
            };
            format!("{name}: {value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn transport_error(e: reqwest::Error) -> TmError {
    if e.is_timeout() {
        TmError::new(ErrorKind::Timeout, format!("Request timed out: {e}"))
    } else if e.is_decode() {
        TmError::format(format!("Malformed response: {e}"))
    } else {
        TmError::new(ErrorKind::TransportUnavailable, format!("Request failed: {e}"))
    }
}

/// Error de una respuesta no 2xx.
pub fn status_error(status: StatusCode, body: &str) -> TmError {
    match status.as_u16() {
        500 | 502 => TmError::new(ErrorKind::TransportUnavailable, "Service unavailable")
            .with_attribute("status", status.as_u16())
            .with_attribute("body", body),
        503 => TmError::new(ErrorKind::RequestBeingProcessed, "Request is being processed")
            .with_attribute("status", status.as_u16()),
        _ => serde_json::from_str::<TmError>(body).unwrap_or_else(|_| {
            TmError::generic(format!("Unexpected status {status}"))
                .with_attribute("status", status.as_u16())
                .with_attribute("body", body)
        }),
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: Option<String>,
    retry: RetryEngine,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        http: &HttpConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(http.request_timeout)
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            client,
            base_url: format!("{}/api/v1", base_url.trim_end_matches('/')),
            token,
            retry: RetryEngine::new(http.retry.clone(), cancel),
        })
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.retry.cancel_token()
    }

    fn headers(&self, params: Option<&MutationParams>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("accept-type"),
            HeaderValue::from_static("application/json"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_NAME));
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("OAuth {token}"))
                .map_err(|_| TmError::new(ErrorKind::Auth, "Token contains invalid characters"))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(params) = params {
            let raw = serde_json::to_string(params)?;
            let value = HeaderValue::from_str(&raw)
                .map_err(|_| TmError::invalid_request("Malformed mutation parameters"))?;
            headers.insert(HeaderName::from_static("x-tm-parameters"), value);
        }
        Ok(headers)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        params: Option<&MutationParams>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let headers = self.headers(params)?;
        debug!(
            "{} {} [{}]",
            method,
            url,
            mask_headers(&headers, self.token.as_deref())
        );

        let mut request = self.client.request(method, &url).headers(headers).query(query);
        if let Some(body) = body {
            request = request.body(body.to_string());
        }
        let resp = request.send().await.map_err(transport_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        Ok(serde_json::from_str(text)?)
    }

    /// Lectura con reintentos.
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.retry
            .run(|_| self.send(Method::GET, path, query, None, None))
            .await
    }

    /// POST sin efecto que deduplicar (consultas con cuerpo, pings).
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: Option<&B>) -> Result<T> {
        let body = body.map(serde_json::to_value).transpose()?;
        self.retry
            .run(|_| self.send(Method::POST, path, &[], body.as_ref(), None))
            .await
    }

    /// Mutación: cada intento lleva `mutation_id` y `retry`.
    pub async fn mutate<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: Option<&B>) -> Result<T> {
        let body = body.map(serde_json::to_value).transpose()?;
        let body = body.as_ref();
        self.retry
            .run_mutating(|params| async move {
                self.send(Method::POST, path, &[], body, Some(&params)).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn el_token_nunca_sale_en_las_cabeceras() {
        let transport = HttpTransport::new(
            "http://localhost:8080/",
            Some("AQAD-very-secret".into()),
            &HttpConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();
        let params = MutationParams::fresh();
        let headers = transport.headers(Some(&params)).unwrap();
        let dump = mask_headers(&headers, Some("AQAD-very-secret"));

        assert!(!dump.contains("AQAD-very-secret"));
        assert!(dump.contains(&format!("OAuth {MASK}")));
        assert!(dump.contains(params.mutation_id.as_str()));
        assert_eq!(transport.base_url, "http://localhost:8080/api/v1");
    }

    #[rstest]
    #[case(500, ErrorKind::TransportUnavailable)]
    #[case(502, ErrorKind::TransportUnavailable)]
    #[case(503, ErrorKind::RequestBeingProcessed)]
    fn estados_de_servicio_son_reintentables(#[case] status: u16, #[case] kind: ErrorKind) {
        let err = status_error(StatusCode::from_u16(status).unwrap(), "");
        assert!(err.is(kind));
        assert!(err.is_retriable());
    }

    #[test]
    fn otros_estados_traen_el_error_del_cuerpo() {
        let body = serde_json::to_string(&TmError::resolve("//a/t")).unwrap();
        let err = status_error(StatusCode::NOT_FOUND, &body);
        assert!(err.is(ErrorKind::Resolve));

        let err = status_error(StatusCode::BAD_REQUEST, "<html>");
        assert_eq!(err.code, tm_common::codes::GENERIC);
        assert_eq!(err.attributes["body"], "<html>");
    }
}
