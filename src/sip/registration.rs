//! SIP trunk registration and inbound request dispatch.
//!
//! One UDP endpoint serves every configured account: each active account
//! REGISTERs against its trunk with digest credentials and refreshes at
//! 75 % of the granted expiry. Inbound out-of-dialog requests feed the
//! invite runtime; in-dialog requests (BYE foremost) are routed through the
//! stack's dialog layer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ftth_rsipstack::dialog::authenticate::Credential;
use ftth_rsipstack::dialog::dialog_layer::DialogLayer;
use ftth_rsipstack::dialog::registration::Registration;
use ftth_rsipstack::dialog::server_dialog::ServerInviteDialog;
use ftth_rsipstack::transaction::endpoint::EndpointInnerRef;
use ftth_rsipstack::transport::{udp::UdpConnection, TransportLayer};
use ftth_rsipstack::EndpointBuilder;
use rsip::headers::UntypedHeader;
use rsip::prelude::HeadersExt;
use tokio_util::sync::CancellationToken;

use super::invite::SipDialog;
use super::SipError;
use crate::runtime::{InviteRequest, InviteRuntime};

/// One SIP trunk account.
#[derive(Debug, Clone)]
pub struct SipAccount {
    pub id: i64,
    pub label: String,
    pub username: String,
    pub password: String,
    pub domain: String,
    pub trunk_host: String,
    pub trunk_port: u16,
    pub is_active: bool,
}

impl SipAccount {
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}:{}", self.trunk_host, self.trunk_port)
    }
}

/// In-memory account table; the invite runtime matches inbound calls to an
/// account by the To-URI username.
pub struct SipAccountStore {
    accounts: Vec<SipAccount>,
}

impl SipAccountStore {
    pub fn new(accounts: Vec<SipAccount>) -> Self {
        Self { accounts }
    }

    pub fn active(&self) -> impl Iterator<Item = &SipAccount> {
        self.accounts.iter().filter(|account| account.is_active)
    }

    pub fn find_active_by_username(&self, username: &str) -> Option<&SipAccount> {
        self.active()
            .find(|account| account.username.eq_ignore_ascii_case(username))
    }
}

/// Network settings for the shared SIP endpoint.
#[derive(Debug, Clone)]
pub struct SipRegistrarConfig {
    /// Local address to bind; empty or `0.0.0.0` triggers detection.
    pub bind_host: String,
    pub bind_port: u16,
}

/// Registers the configured accounts and pumps inbound SIP traffic into the
/// invite runtime.
pub struct SipRegistrar {
    config: SipRegistrarConfig,
    accounts: Arc<SipAccountStore>,
    cancel: CancellationToken,
}

impl SipRegistrar {
    pub fn new(config: SipRegistrarConfig, accounts: Arc<SipAccountStore>) -> Self {
        Self {
            config,
            accounts,
            cancel: CancellationToken::new(),
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// First non-loopback IPv4 address, for Contact and media lines.
    pub fn detect_local_ipv4() -> Result<std::net::IpAddr, SipError> {
        for iface in
            get_if_addrs::get_if_addrs().map_err(|e| SipError::Transport(e.to_string()))?
        {
            if !iface.is_loopback() {
                if let get_if_addrs::IfAddr::V4(ref addr) = iface.addr {
                    return Ok(std::net::IpAddr::V4(addr.ip));
                }
            }
        }
        Err(SipError::Transport("no IPv4 interface found".to_string()))
    }

    /// Bind the endpoint, register every active account and serve inbound
    /// traffic until cancelled.
    pub async fn run(&self, runtime: Arc<InviteRuntime>) -> Result<(), SipError> {
        let local_ip = if self.config.bind_host.is_empty() || self.config.bind_host == "0.0.0.0" {
            Self::detect_local_ipv4()?.to_string()
        } else {
            self.config.bind_host.clone()
        };
        tracing::info!("SIP endpoint local address: {}", local_ip);

        let token = self.cancel.clone();
        let mut transport_layer = TransportLayer::new(token.clone());

        // Route outbound requests through the first active trunk.
        let default_account = self.accounts.active().next().cloned();
        if let Some(account) = &default_account {
            let trunk_addr = format!("{}:{}", account.trunk_host, account.trunk_port);
            let lookup_result = tokio::net::lookup_host(&trunk_addr).await;
            if let Ok(mut resolved) = lookup_result {
                if let Some(addr) = resolved.next() {
                    tracing::info!("SIP trunk {} resolved to {}", account.trunk_host, addr);
                    transport_layer.outbound =
                        Some(ftth_rsipstack::transport::SipAddr::from(addr));
                }
            }
        }

        let local_addr: SocketAddr = format!("{}:{}", local_ip, self.config.bind_port)
            .parse()
            .map_err(|e: std::net::AddrParseError| SipError::Transport(e.to_string()))?;
        let connection = UdpConnection::create_connection(local_addr, None, Some(token.child_token()))
            .await
            .map_err(|e| SipError::Transport(format!("SIP bind {}: {:?}", local_addr, e)))?;
        transport_layer.add_transport(connection.into());

        let endpoint = EndpointBuilder::new()
            .with_cancel_token(token.clone())
            .with_transport_layer(transport_layer)
            .with_user_agent("voice-gateway/0.1")
            .build();

        let incoming = endpoint
            .incoming_transactions()
            .map_err(|e| SipError::Transport(format!("{:?}", e)))?;
        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
        let (state_sender, mut state_receiver) = tokio::sync::mpsc::unbounded_channel();

        let contact_user = default_account
            .as_ref()
            .map(|account| account.username.clone())
            .unwrap_or_else(|| "gateway".to_string());
        let contact = rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: Some(rsip::Auth {
                user: contact_user,
                password: None,
            }),
            host_with_port: local_addr.into(),
            ..Default::default()
        };

        let endpoint_inner = endpoint.inner.clone();

        let serve_task = tokio::spawn(async move {
            let _ = endpoint.serve().await;
            tracing::info!("SIP endpoint service stopped");
        });

        // Dialog state transitions are informational here; teardown rides on
        // the BYE transactions themselves.
        tokio::spawn(async move {
            while let Some(state) = state_receiver.recv().await {
                tracing::debug!("SIP dialog state: {}", state);
            }
        });

        let inbound_task = {
            let dialog_layer = dialog_layer.clone();
            let runtime = runtime.clone();
            let contact = contact.clone();
            tokio::spawn(async move {
                if let Err(e) = process_incoming_requests(
                    dialog_layer,
                    incoming,
                    state_sender,
                    contact,
                    runtime,
                )
                .await
                {
                    tracing::error!("SIP inbound loop error: {:?}", e);
                }
            })
        };

        for account in self.accounts.active() {
            self.spawn_registration(endpoint_inner.clone(), account.clone(), token.clone());
        }

        tokio::select! {
            _ = token.cancelled() => {}
            _ = serve_task => {}
            _ = inbound_task => {}
        }
        Ok(())
    }

    /// REGISTER one account and keep it fresh at 75 % of the granted
    /// expiry.
    fn spawn_registration(
        &self,
        endpoint_inner: EndpointInnerRef,
        account: SipAccount,
        token: CancellationToken,
    ) {
        tokio::spawn(async move {
            let credential = Credential {
                username: account.username.clone(),
                password: account.password.clone(),
                realm: Some(account.domain.clone()),
            };
            let server_uri: rsip::Uri = match account.registrar_uri().as_str().try_into() {
                Ok(uri) => uri,
                Err(e) => {
                    tracing::error!(
                        "invalid registrar URI for account '{}': {:?}",
                        account.label,
                        e
                    );
                    return;
                }
            };

            let mut registration = Registration::new(endpoint_inner, Some(credential));
            loop {
                let expires = match tokio::time::timeout(
                    Duration::from_secs(10),
                    registration.register(server_uri.clone(), Some(3600)),
                )
                .await
                {
                    Ok(Ok(response)) if response.status_code == rsip::StatusCode::OK => {
                        let expires = registration.expires().max(60) as u64;
                        tracing::info!(
                            "SIP registration for '{}' successful, expires in {}s",
                            account.label,
                            expires
                        );
                        expires
                    }
                    Ok(Ok(response)) => {
                        tracing::warn!(
                            "SIP registration for '{}' failed: {:?}, retrying in 60s",
                            account.label,
                            response.status_code
                        );
                        60
                    }
                    Ok(Err(e)) => {
                        tracing::error!(
                            "SIP registration error for '{}': {:?}, retrying in 60s",
                            account.label,
                            e
                        );
                        60
                    }
                    Err(_) => {
                        tracing::error!(
                            "SIP registration for '{}' timed out, retrying in 60s",
                            account.label
                        );
                        60
                    }
                };

                let refresh = (expires * 3 / 4).max(30);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(refresh)) => {}
                }
            }
        });
    }
}

/// Inbound transaction loop: INVITE spawns a call, OPTIONS is answered
/// inline, in-dialog requests are delegated to the matched dialog.
async fn process_incoming_requests(
    dialog_layer: Arc<DialogLayer>,
    mut incoming: ftth_rsipstack::transaction::TransactionReceiver,
    state_sender: ftth_rsipstack::dialog::dialog::DialogStateSender,
    contact: rsip::Uri,
    runtime: Arc<InviteRuntime>,
) -> ftth_rsipstack::Result<()> {
    while let Some(mut tx) = incoming.recv().await {
        let call_id = tx
            .original
            .call_id_header()
            .map(|h| h.value().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let method = tx.original.method.clone();
        tracing::debug!("inbound SIP request {} (Call-ID={})", method, call_id);

        // In-dialog requests carry a To tag; hand them to their dialog.
        let has_to_tag = tx
            .original
            .to_header()
            .ok()
            .and_then(|to| to.tag().ok().flatten())
            .is_some();
        if has_to_tag {
            match dialog_layer.match_dialog(&tx.original) {
                Some(mut dialog) => {
                    let runtime = runtime.clone();
                    let call_id = call_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dialog.handle(&mut tx).await {
                            tracing::warn!(
                                "in-dialog request handling failed (Call-ID={}): {:?}",
                                call_id,
                                e
                            );
                        }
                        if method == rsip::Method::Bye {
                            runtime.handle_bye(&call_id).await;
                        }
                    });
                }
                None => {
                    tracing::warn!("no dialog for in-dialog request (Call-ID={})", call_id);
                    tx.reply(rsip::StatusCode::CallTransactionDoesNotExist)
                        .await?;
                }
            }
            continue;
        }

        match method {
            rsip::Method::Invite => {
                let request = InviteRequest {
                    call_id: call_id.clone(),
                    headers: header_pairs(&tx.original.headers),
                    sdp: tx.original.body.clone(),
                };

                let dialog = match dialog_layer.get_or_create_server_invite(
                    &tx,
                    state_sender.clone(),
                    None,
                    Some(contact.clone()),
                ) {
                    Ok(dialog) => dialog,
                    Err(e) => {
                        tracing::warn!(
                            "failed to create server dialog (Call-ID={}): {:?}",
                            call_id,
                            e
                        );
                        tx.reply(rsip::StatusCode::CallTransactionDoesNotExist)
                            .await?;
                        continue;
                    }
                };

                let adapter: Arc<dyn SipDialog> = Arc::new(ServerDialogAdapter { dialog });
                let runtime = runtime.clone();
                tokio::spawn(async move {
                    runtime.handle_invite(adapter, request).await;
                });
            }
            rsip::Method::Options => {
                tx.reply(rsip::StatusCode::OK).await?;
            }
            rsip::Method::Ack => {
                // ACK for our 200 is absorbed by the transaction layer.
            }
            _ => {
                tx.reply(rsip::StatusCode::MethodNotAllowed).await?;
            }
        }
    }
    Ok(())
}

/// Flatten a header list into name/value pairs for the runtime.
fn header_pairs(headers: &rsip::Headers) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|header| {
            let text = header.to_string();
            text.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Bridges the stack's server dialog onto the invite flow's dialog trait.
struct ServerDialogAdapter {
    dialog: ServerInviteDialog,
}

#[async_trait]
impl SipDialog for ServerDialogAdapter {
    async fn reply(&self, status: u16, reason: &str, sdp: Option<String>) -> Result<(), SipError> {
        match status {
            // The transaction layer emits 100 Trying on its own.
            100 => Ok(()),
            180 => self
                .dialog
                .ringing(None, None)
                .map_err(|e| SipError::Transport(format!("180 failed: {:?}", e))),
            200 => {
                let headers =
                    vec![rsip::typed::ContentType(rsip::typed::MediaType::Sdp(vec![])).into()];
                let body = sdp.map(String::into_bytes);
                self.dialog
                    .accept(Some(headers), body)
                    .map_err(|e| SipError::Transport(format!("200 failed: {:?}", e)))
            }
            other => {
                let code = rsip::StatusCode::try_from(other)
                    .unwrap_or(rsip::StatusCode::ServerInternalError);
                self.dialog
                    .reject(Some(code), Some(reason.into()))
                    .map_err(|e| SipError::Transport(format!("{} failed: {:?}", other, e)))
            }
        }
    }

    async fn hangup(&self) -> Result<(), SipError> {
        self.dialog
            .bye()
            .await
            .map_err(|e| SipError::Transport(format!("BYE failed: {:?}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: i64, username: &str, active: bool) -> SipAccount {
        SipAccount {
            id,
            label: format!("account-{}", id),
            username: username.to_string(),
            password: "secret".to_string(),
            domain: "sip.example.com".to_string(),
            trunk_host: "sip.example.com".to_string(),
            trunk_port: 5060,
            is_active: active,
        }
    }

    #[test]
    fn account_lookup_is_case_insensitive_and_skips_inactive() {
        let store = SipAccountStore::new(vec![
            account(1, "gateway", true),
            account(2, "support", false),
        ]);

        assert_eq!(store.find_active_by_username("Gateway").unwrap().id, 1);
        assert!(store.find_active_by_username("support").is_none());
        assert!(store.find_active_by_username("missing").is_none());
        assert_eq!(store.active().count(), 1);
    }

    #[test]
    fn registrar_uri_includes_trunk_port() {
        assert_eq!(
            account(1, "gateway", true).registrar_uri(),
            "sip:sip.example.com:5060"
        );
    }
}
