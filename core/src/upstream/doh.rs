// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! DNS-over-HTTPS upstream: a long-lived HTTP/2 client, extended from the
//! teacher's POST-only `PostClient` (`droute/.../qhandle/https.rs`) with
//! RFC 8484 §4.1 GET framing (base64url, no padding).

use super::{Protocol, Upstream, UpstreamError};
use crate::codec::rewrite_id;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use domain::base::Message;
use reqwest::{Client, Url};
use std::time::Duration;

/// Whether a DoH exchange is framed as a GET (base64url `dns=` query param)
/// or a POST (wire body), both accepted per RFC 8484.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `GET {url}?dns=<base64url(wire)>`.
    Get,
    /// `POST {url}` with the wire bytes as the body.
    Post,
}

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A DNS-over-HTTPS upstream.
pub struct DohUpstream {
    client: Client,
    url: Url,
    framing: Framing,
}

impl DohUpstream {
    /// Build a DoH upstream. `max_conns` bounds both `max_idle_per_host` and
    /// HTTP/2 connection reuse; `query_timeout` becomes the response-header
    /// timeout.
    pub fn new(
        url: &str,
        framing: Framing,
        max_conns: usize,
        query_timeout: Duration,
        proxy: Option<String>,
    ) -> Result<Self, UpstreamError> {
        let url = Url::parse(url).map_err(|_| UpstreamError::InvalidEndpoint(url.to_string()))?;
        if url.domain().is_none() {
            return Err(UpstreamError::InvalidEndpoint(url.to_string()));
        }

        let mut builder = Client::builder()
            .user_agent(APP_USER_AGENT)
            .https_only(true)
            .http2_prior_knowledge()
            .http2_keep_alive_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(max_conns.max(1))
            .connect_timeout(Duration::from_secs(5))
            .timeout(query_timeout);

        if let Some(proxy) = proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(&proxy)
                    .map_err(|e| UpstreamError::Doh(e.to_string()))?,
            );
        }

        let client = builder
            .build()
            .map_err(|e| UpstreamError::Doh(e.to_string()))?;

        Ok(Self {
            client,
            url,
            framing,
        })
    }

    async fn exchange_get(&self, wire: &[u8]) -> Result<Bytes, UpstreamError> {
        let encoded = base64::encode_config(wire, base64::URL_SAFE_NO_PAD);
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("dns", &encoded);
        let response = self
            .client
            .get(url)
            .header("accept", "application/dns-message")
            .send()
            .await
            .map_err(|e| UpstreamError::Doh(e.to_string()))?;
        Self::read_body(response).await
    }

    async fn exchange_post(&self, wire: Bytes) -> Result<Bytes, UpstreamError> {
        let response = self
            .client
            .post(self.url.clone())
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(wire)
            .send()
            .await
            .map_err(|e| UpstreamError::Doh(e.to_string()))?;
        Self::read_body(response).await
    }

    async fn read_body(response: reqwest::Response) -> Result<Bytes, UpstreamError> {
        if !response.status().is_success() {
            return Err(UpstreamError::Doh(format!(
                "unsuccessful HTTP status: {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Doh(e.to_string()))
    }
}

#[async_trait]
impl Upstream for DohUpstream {
    async fn exchange(
        &self,
        query: &Message<Bytes>,
        _is_tcp_client: bool,
    ) -> Result<Message<Bytes>, UpstreamError> {
        let original_id = query.header().id();

        // RFC 8484 §4.1: the id SHOULD be 0 to maximise cache-friendliness
        // on intermediaries.
        let mut outgoing =
            Message::from_octets(BytesMut::from(query.as_slice())).expect("query already parsed");
        outgoing.header_mut().set_id(0);
        let wire = Bytes::copy_from_slice(outgoing.as_slice());

        let body = match self.framing {
            Framing::Get => self.exchange_get(&wire).await?,
            Framing::Post => self.exchange_post(wire).await?,
        };

        let response = Message::from_octets(body)?;
        Ok(rewrite_id(response, original_id))
    }
}


/// `DohUpstream` always speaks [`Protocol::Doh`].
pub const PROTOCOL: Protocol = Protocol::Doh;
