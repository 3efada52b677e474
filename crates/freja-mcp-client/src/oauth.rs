// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OAuth for remote MCP servers.
//!
//! Managed flow: metadata discovery, optional dynamic client registration,
//! a loopback redirect listener, PKCE (S256), browser hand-off, and the
//! code exchange with RFC 8707 resource binding.  Unmanaged flow: the same
//! discovery, but the authorization interaction is delegated to the
//! external client via elicitation and the client hands back a token.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use base64::Engine;
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};
use url::Url;

use freja_tools::{ElicitationAction, ElicitationHandler, ElicitationRequest};

use crate::tokens::{OAuthToken, TokenCache};

/// Deadline for metadata discovery requests.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Read/write deadline on the loopback callback connection.
const CALLBACK_IO_TIMEOUT: Duration = Duration::from_secs(10);

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Authorization-server endpoints, discovered or synthesized.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
}

impl AuthServerMetadata {
    /// Conventional endpoints for servers that publish no metadata at all.
    pub fn synthesized(issuer: &str) -> Self {
        let base = issuer.trim_end_matches('/');
        Self {
            issuer: base.to_string(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            registration_endpoint: None,
        }
    }
}

/// Extract the `resource="…"` parameter from a `WWW-Authenticate: Bearer`
/// challenge.
pub fn parse_www_authenticate(header: &str) -> Option<String> {
    let rest = header.trim().strip_prefix("Bearer")?.trim();
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(value) = part
            .strip_prefix("resource=")
            .or_else(|| part.strip_prefix("resource_metadata="))
        {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

/// Where a server advertises its protected-resource metadata.
pub fn protected_resource_metadata_url(server_url: &str) -> anyhow::Result<String> {
    let url = Url::parse(server_url).context("invalid server URL")?;
    let origin = url.origin().ascii_serialization();
    Ok(format!("{origin}/.well-known/oauth-protected-resource"))
}

/// PKCE verifier/challenge pair (S256).
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 48];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = B64.encode(bytes);
        Self { challenge: Self::challenge_for(&verifier), verifier }
    }

    fn challenge_for(verifier: &str) -> String {
        B64.encode(Sha256::digest(verifier.as_bytes()))
    }
}

/// 16 random bytes, hex-encoded, used to correlate the callback.
pub fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Build the browser URL for the authorization request.
pub fn build_authorize_url(
    meta: &AuthServerMetadata,
    client_id: &str,
    redirect_uri: &str,
    pkce: &Pkce,
    state: &str,
    resource: &str,
) -> anyhow::Result<String> {
    let mut url = Url::parse(&meta.authorization_endpoint).context("authorization endpoint")?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", state)
        .append_pair("resource", resource);
    Ok(url.to_string())
}

/// Parse `code` and `state` out of the callback request path.
pub fn parse_callback_query(path: &str) -> anyhow::Result<(String, String)> {
    let url = Url::parse(&format!("http://localhost{path}")).context("callback path")?;
    let mut code = None;
    let mut state = None;
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            "error" => bail!("authorization denied: {v}"),
            _ => {}
        }
    }
    match (code, state) {
        (Some(c), Some(s)) => Ok((c, s)),
        _ => bail!("callback missing code or state"),
    }
}

/// Discover authorization-server metadata with the standard fallback chain.
pub async fn discover_auth_server(
    http: &reqwest::Client,
    issuer: &str,
) -> AuthServerMetadata {
    let base = issuer.trim_end_matches('/');
    for path in [
        "/.well-known/oauth-authorization-server",
        "/.well-known/openid-configuration",
    ] {
        let url = format!("{base}{path}");
        match http.get(&url).timeout(DISCOVERY_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                if let Ok(v) = resp.json::<serde_json::Value>().await {
                    if let (Some(authz), Some(token)) = (
                        v["authorization_endpoint"].as_str(),
                        v["token_endpoint"].as_str(),
                    ) {
                        return AuthServerMetadata {
                            issuer: base.to_string(),
                            authorization_endpoint: authz.to_string(),
                            token_endpoint: token.to_string(),
                            registration_endpoint: v["registration_endpoint"]
                                .as_str()
                                .map(str::to_string),
                        };
                    }
                }
            }
            Ok(_) | Err(_) => {}
        }
    }
    debug!(%issuer, "no metadata published; synthesizing conventional endpoints");
    AuthServerMetadata::synthesized(base)
}

/// Resolve the authorization server for `server_url`, starting from the
/// `WWW-Authenticate` challenge when one was seen.
pub async fn discover_for_server(
    http: &reqwest::Client,
    server_url: &str,
    www_authenticate: Option<&str>,
    gateway_url: Option<&str>,
) -> anyhow::Result<AuthServerMetadata> {
    // Gateway selection is injected configuration, never read from the
    // process environment.
    if let Some(gateway) = gateway_url {
        return Ok(discover_auth_server(http, gateway).await);
    }

    let resource = www_authenticate
        .and_then(parse_www_authenticate)
        .map(Ok)
        .unwrap_or_else(|| {
            Url::parse(server_url)
                .map(|u| u.origin().ascii_serialization())
                .context("invalid server URL")
        })?;

    let meta_url = protected_resource_metadata_url(&resource)?;
    let issuer = match http.get(&meta_url).timeout(DISCOVERY_TIMEOUT).send().await {
        Ok(resp) if resp.status().is_success() => resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| {
                v["authorization_servers"]
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(|s| s.as_str())
                    .map(str::to_string)
            }),
        _ => None,
    };
    let issuer = issuer.unwrap_or_else(|| {
        Url::parse(&resource)
            .map(|u| u.origin().ascii_serialization())
            .unwrap_or_else(|_| resource.clone())
    });
    Ok(discover_auth_server(http, &issuer).await)
}

/// Register a client dynamically when the server offers it; otherwise use
/// the static client name.
async fn obtain_client_id(
    http: &reqwest::Client,
    meta: &AuthServerMetadata,
    redirect_uri: &str,
) -> String {
    let endpoint = match &meta.registration_endpoint {
        Some(e) => e.clone(),
        None => return crate::protocol::CLIENT_NAME.to_string(),
    };
    let body = json!({
        "client_name": crate::protocol::CLIENT_NAME,
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });
    match http
        .post(&endpoint)
        .timeout(DISCOVERY_TIMEOUT)
        .json(&body)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v["client_id"].as_str().map(str::to_string))
            .unwrap_or_else(|| crate::protocol::CLIENT_NAME.to_string()),
        _ => {
            warn!("dynamic client registration failed; using static client id");
            crate::protocol::CLIENT_NAME.to_string()
        }
    }
}

/// One-shot loopback HTTP listener for the authorization redirect.
struct CallbackServer {
    listener: TcpListener,
    port: u16,
}

impl CallbackServer {
    async fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("binding loopback callback listener")?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    /// Wait for the browser redirect and return `(code, state)`.  The accept
    /// itself honors the caller's context (dropping this future stops the
    /// wait); per-connection I/O has fixed deadlines.
    async fn wait(&self) -> anyhow::Result<(String, String)> {
        loop {
            let (mut conn, _) = self.listener.accept().await.context("callback accept")?;

            let mut buf = Vec::with_capacity(1024);
            let read = tokio::time::timeout(CALLBACK_IO_TIMEOUT, async {
                let mut chunk = [0u8; 512];
                loop {
                    let n = conn.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 16 * 1024 {
                        break;
                    }
                }
                Ok::<(), std::io::Error>(())
            })
            .await;
            if read.is_err() {
                continue;
            }

            let request = String::from_utf8_lossy(&buf);
            let path = request
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or("/");

            // Browsers probe for favicons; only the callback path counts.
            if !path.starts_with("/callback") {
                let _ = tokio::time::timeout(
                    CALLBACK_IO_TIMEOUT,
                    conn.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"),
                )
                .await;
                continue;
            }

            let result = parse_callback_query(path);
            let page = match &result {
                Ok(_) => "Authorization complete. You can close this tab.",
                Err(_) => "Authorization failed. You can close this tab.",
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{page}",
                page.len()
            );
            let _ = tokio::time::timeout(CALLBACK_IO_TIMEOUT, conn.write_all(response.as_bytes()))
                .await;
            return result;
        }
    }
}

/// Exchange the authorization code for a token, binding it to the resource.
async fn exchange_code(
    http: &reqwest::Client,
    meta: &AuthServerMetadata,
    client_id: &str,
    redirect_uri: &str,
    code: &str,
    verifier: &str,
    resource: &str,
) -> anyhow::Result<OAuthToken> {
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", verifier),
        ("resource", resource),
    ];
    let resp = http
        .post(&meta.token_endpoint)
        .form(&form)
        .send()
        .await
        .context("token exchange request failed")?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        bail!("token exchange failed {status}: {text}");
    }
    resp.json::<OAuthToken>().await.context("invalid token response")
}

/// Drive the managed browser flow for `server_url` and cache the token.
pub async fn managed_flow(
    http: &reqwest::Client,
    server_url: &str,
    www_authenticate: Option<&str>,
    gateway_url: Option<&str>,
    cache: &TokenCache,
) -> anyhow::Result<OAuthToken> {
    let meta = discover_for_server(http, server_url, www_authenticate, gateway_url).await?;

    let callback = CallbackServer::bind().await?;
    let redirect_uri = callback.redirect_uri();
    let client_id = obtain_client_id(http, &meta, &redirect_uri).await;

    let pkce = Pkce::generate();
    let state = random_state();
    let authorize_url =
        build_authorize_url(&meta, &client_id, &redirect_uri, &pkce, &state, server_url)?;

    debug!(endpoint = %meta.authorization_endpoint, "opening browser for authorization");
    webbrowser::open(&authorize_url).context("opening browser")?;

    let (code, returned_state) = callback.wait().await?;
    if returned_state != state {
        bail!("authorization state mismatch");
    }

    let token = exchange_code(
        http,
        &meta,
        &client_id,
        &redirect_uri,
        &code,
        &pkce.verifier,
        server_url,
    )
    .await?;
    cache.put(server_url, token.clone());
    Ok(token)
}

/// Delegate the authorization interaction to the external client via
/// elicitation; the client returns a token object which is stored and used
/// exactly like a managed one.
pub async fn delegated_flow(
    http: &reqwest::Client,
    server_url: &str,
    www_authenticate: Option<&str>,
    gateway_url: Option<&str>,
    cache: &TokenCache,
    handler: Arc<dyn ElicitationHandler>,
) -> anyhow::Result<OAuthToken> {
    let meta = discover_for_server(http, server_url, www_authenticate, gateway_url).await?;

    let request = ElicitationRequest {
        message: format!(
            "Authorization required for {server_url}. \
             Complete the OAuth flow at {} and provide the token.",
            meta.authorization_endpoint
        ),
        schema: Some(json!({
            "type": "object",
            "properties": {
                "access_token": { "type": "string" },
                "token_type": { "type": "string" },
                "expires_in": { "type": "integer" },
                "refresh_token": { "type": "string" }
            },
            "required": ["access_token"]
        })),
    };
    let response = handler.elicit(request).await?;
    if response.action != ElicitationAction::Accept {
        bail!("authorization declined by client");
    }
    let content = response.content.ok_or_else(|| anyhow!("no token provided"))?;
    let token: OAuthToken =
        serde_json::from_value(content).context("invalid token from client")?;
    cache.put(server_url, token.clone());
    Ok(token)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_www_authenticate_resource() {
        let header = r#"Bearer resource="https://mcp.example.com/v1", error="invalid_token""#;
        assert_eq!(
            parse_www_authenticate(header).as_deref(),
            Some("https://mcp.example.com/v1")
        );
    }

    #[test]
    fn parse_www_authenticate_without_resource_is_none() {
        assert!(parse_www_authenticate(r#"Bearer error="invalid_token""#).is_none());
        assert!(parse_www_authenticate("Basic realm=x").is_none());
    }

    #[test]
    fn metadata_url_uses_origin_only() {
        let url = protected_resource_metadata_url("https://mcp.example.com/v1/rpc?x=1").unwrap();
        assert_eq!(url, "https://mcp.example.com/.well-known/oauth-protected-resource");
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_vector() {
        // Appendix B of RFC 7636.
        let challenge = Pkce::challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn pkce_verifier_is_unpadded_base64url() {
        let pkce = Pkce::generate();
        assert!(pkce.verifier.len() >= 43);
        assert!(!pkce.verifier.contains('='));
        assert!(!pkce.verifier.contains('+'));
        assert!(!pkce.verifier.contains('/'));
    }

    #[test]
    fn state_is_16_random_bytes_hex() {
        let a = random_state();
        let b = random_state();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn authorize_url_carries_pkce_state_and_resource() {
        let meta = AuthServerMetadata::synthesized("https://auth.example.com");
        let pkce = Pkce::generate();
        let url = build_authorize_url(
            &meta,
            "freja",
            "http://127.0.0.1:7777/callback",
            &pkce,
            "st4te",
            "https://mcp.example.com",
        )
        .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["code_challenge"], pkce.challenge.as_str());
        assert_eq!(pairs["state"], "st4te");
        assert_eq!(pairs["resource"], "https://mcp.example.com");
    }

    #[test]
    fn synthesized_metadata_uses_conventional_paths() {
        let meta = AuthServerMetadata::synthesized("https://auth.example.com/");
        assert_eq!(meta.authorization_endpoint, "https://auth.example.com/authorize");
        assert_eq!(meta.token_endpoint, "https://auth.example.com/token");
        assert!(meta.registration_endpoint.is_none());
    }

    #[test]
    fn callback_query_parses_code_and_state() {
        let (code, state) = parse_callback_query("/callback?code=abc123&state=xyz").unwrap();
        assert_eq!(code, "abc123");
        assert_eq!(state, "xyz");
    }

    #[test]
    fn callback_error_param_fails() {
        let err = parse_callback_query("/callback?error=access_denied&state=x").unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }

    #[test]
    fn callback_missing_code_fails() {
        assert!(parse_callback_query("/callback?state=x").is_err());
    }

    #[tokio::test]
    async fn callback_server_round_trip() {
        let server = CallbackServer::bind().await.unwrap();
        let uri = server.redirect_uri();
        let port = server.port;

        let wait = tokio::spawn(async move { server.wait().await });

        // Simulate the browser redirect.
        let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"GET /callback?code=c0de&state=s7 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await.unwrap();
        assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 200"));

        let (code, state) = wait.await.unwrap().unwrap();
        assert_eq!(code, "c0de");
        assert_eq!(state, "s7");
        assert!(uri.ends_with("/callback"));
    }

    #[tokio::test]
    async fn callback_server_ignores_other_paths() {
        let server = CallbackServer::bind().await.unwrap();
        let port = server.port;
        let wait = tokio::spawn(async move { server.wait().await });

        let mut probe = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        probe
            .write_all(b"GET /favicon.ico HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        drop(probe);

        let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"GET /callback?code=k&state=s HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let (code, _) = wait.await.unwrap().unwrap();
        assert_eq!(code, "k");
    }

    #[tokio::test]
    async fn delegated_flow_stores_client_token() {
        use async_trait::async_trait;
        use freja_tools::ElicitationResponse;

        struct HandToken;

        #[async_trait]
        impl ElicitationHandler for HandToken {
            async fn elicit(
                &self,
                req: ElicitationRequest,
            ) -> anyhow::Result<ElicitationResponse> {
                assert!(req.message.contains("Authorization required"));
                Ok(ElicitationResponse {
                    action: ElicitationAction::Accept,
                    content: Some(json!({ "access_token": "tok-1", "expires_in": 3600 })),
                })
            }
        }

        let cache = TokenCache::new();
        let http = reqwest::Client::new();
        // Gateway injection short-circuits discovery so no network is needed.
        let token = delegated_flow(
            &http,
            "https://mcp.example.com",
            None,
            Some("http://127.0.0.1:1"),
            &cache,
            Arc::new(HandToken),
        )
        .await
        .unwrap();
        assert_eq!(token.access_token, "tok-1");
        assert_eq!(
            cache.get("https://mcp.example.com").unwrap().access_token,
            "tok-1"
        );
    }

    #[tokio::test]
    async fn delegated_flow_decline_is_an_error() {
        use async_trait::async_trait;
        use freja_tools::ElicitationResponse;

        struct Decline;

        #[async_trait]
        impl ElicitationHandler for Decline {
            async fn elicit(
                &self,
                _req: ElicitationRequest,
            ) -> anyhow::Result<ElicitationResponse> {
                Ok(ElicitationResponse { action: ElicitationAction::Decline, content: None })
            }
        }

        let cache = TokenCache::new();
        let http = reqwest::Client::new();
        let err = delegated_flow(
            &http,
            "https://mcp.example.com",
            None,
            Some("http://127.0.0.1:1"),
            &cache,
            Arc::new(Decline),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("declined"));
    }
}
