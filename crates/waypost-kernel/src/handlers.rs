//! Request dispatch.
//!
//! Every request is gated twice: first by the roles of the listener it
//! arrived on (`error_bad_role`), then by the conversation status of the
//! connection (`error_bad_conversation_status`). Handlers that wait on
//! another connection (calls, binds) run in the connection's deferred set;
//! relayed sends are answered through the mailbox once the peer acknowledges.

use crate::connection::{Connection, Deferred};
use crate::directory::{HostingStatus, ProfileUpdate};
use crate::session::ConversationStatus;
use tracing::{debug, info};
use waypost_relay::{BindOutcome, RelayToken};
use waypost_search::cursor::read_part;
use waypost_search::SearchQuery;
use waypost_types::config::ServerRole;
use waypost_types::error::{WaypostError, WaypostResult};
use waypost_types::identity::IdentityId;
use waypost_types::profile::EncodedLocation;
use waypost_wire::message::{ResponseBody, WireRequest, WireResponse};

const CLIENT_ROLES: &[ServerRole] = &[ServerRole::ClientNonCustomer, ServerRole::ClientCustomer];
const CUSTOMER_ROLES: &[ServerRole] = &[ServerRole::ClientCustomer];
const APP_SERVICE_ROLES: &[ServerRole] = &[ServerRole::ClientAppService];

/// Roles that serve `request`. Empty for requests only the node may send.
fn serving_roles(request: &WireRequest) -> &'static [ServerRole] {
    match request {
        WireRequest::Ping { .. } => &ServerRole::ALL,
        WireRequest::ListRoles => &[ServerRole::Primary],
        WireRequest::StartConversation { .. }
        | WireRequest::VerifyIdentity { .. }
        | WireRequest::RegisterHosting { .. }
        | WireRequest::GetIdentityInformation { .. }
        | WireRequest::CallIdentityApplicationService { .. }
        | WireRequest::Search { .. }
        | WireRequest::SearchPart { .. } => CLIENT_ROLES,
        WireRequest::CheckIn { .. }
        | WireRequest::UpdateProfile { .. }
        | WireRequest::CancelHostingAgreement { .. }
        | WireRequest::ApplicationServiceAdd { .. }
        | WireRequest::ApplicationServiceRemove { .. } => CUSTOMER_ROLES,
        WireRequest::ApplicationServiceBind { .. }
        | WireRequest::ApplicationServiceSendMessage { .. } => APP_SERVICE_ROLES,
        WireRequest::IncomingCallNotification { .. }
        | WireRequest::ApplicationServiceReceiveMessageNotification { .. } => &[],
    }
}

/// Reply now, or later through the deferred set or the mailbox.
type Handled = WaypostResult<Option<WireResponse>>;

fn reply(body: ResponseBody) -> Handled {
    Ok(Some(WireResponse::ok_with(body)))
}

fn reply_ok() -> Handled {
    Ok(Some(WireResponse::ok()))
}

impl Connection {
    /// Handle one client request. `None` means the response is sent later.
    pub(crate) fn handle_request(&mut self, id: u32, request: WireRequest) -> Option<WireResponse> {
        let method = request.method();
        match self.dispatch(id, request) {
            Ok(response) => response,
            Err(e) => {
                debug!(conn = %self.id, id, method, error = %e, "Request failed");
                Some(WireResponse::from_error(&e))
            }
        }
    }

    fn dispatch(&mut self, id: u32, request: WireRequest) -> Handled {
        let roles = serving_roles(&request);
        if roles.is_empty() {
            return Err(WaypostError::Unsupported(format!(
                "{} is sent by the node only",
                request.method()
            )));
        }
        if !roles.iter().any(|r| self.serves(*r)) {
            return Err(WaypostError::BadRole);
        }

        match request {
            WireRequest::Ping { payload } => self.ping(payload),
            WireRequest::ListRoles => reply(ResponseBody::ListRoles {
                roles: self.state.roles.clone(),
            }),
            WireRequest::StartConversation {
                public_key,
                client_challenge,
                supported_versions,
            } => {
                let body = self.session.start(
                    &self.state.keys,
                    &public_key,
                    &client_challenge,
                    &supported_versions,
                )?;
                debug!(conn = %self.id, version = ?self.session.version(), "Conversation started");
                reply(body)
            }
            WireRequest::VerifyIdentity {
                challenge,
                signature,
            } => {
                let identity = self.session.verify(&challenge, &signature)?;
                info!(conn = %self.id, %identity, "Identity verified");
                reply_ok()
            }
            WireRequest::CheckIn {
                challenge,
                signature,
            } => self.check_in(&challenge, &signature),
            WireRequest::RegisterHosting { identity_type } => self.register_hosting(&identity_type),
            WireRequest::UpdateProfile {
                name,
                location,
                extra_data,
                thumbnail,
            } => self.update_profile(ProfileUpdate {
                name,
                location,
                extra_data,
                thumbnail,
            }),
            WireRequest::CancelHostingAgreement {
                redirect_identity_id,
            } => self.cancel_hosting(redirect_identity_id.as_deref()),
            WireRequest::GetIdentityInformation {
                identity_id,
                include_thumbnail,
                include_application_services,
            } => self.identity_information(
                &identity_id,
                include_thumbnail,
                include_application_services,
            ),
            WireRequest::ApplicationServiceAdd { service_names } => {
                self.add_services(&service_names)
            }
            WireRequest::ApplicationServiceRemove { service_name } => {
                self.remove_service(&service_name)
            }
            WireRequest::CallIdentityApplicationService {
                identity_id,
                service_name,
            } => self.call(id, &identity_id, service_name),
            WireRequest::ApplicationServiceBind { token } => self.bind(id, &token),
            WireRequest::ApplicationServiceSendMessage { token, message } => {
                self.send_message(id, &token, message)
            }
            WireRequest::Search {
                profile_type,
                name,
                extra_data,
                location,
                radius,
                max_response_record_count,
                max_total_record_count,
                hosted_only,
                include_thumbnails,
            } => self.search(SearchQuery {
                profile_type,
                name,
                extra_data,
                location,
                radius,
                max_response_record_count,
                max_total_record_count,
                hosted_only,
                include_thumbnails,
            }),
            WireRequest::SearchPart {
                record_index,
                record_count,
            } => self.search_part(record_index, record_count),
            WireRequest::IncomingCallNotification { .. }
            | WireRequest::ApplicationServiceReceiveMessageNotification { .. } => {
                Err(WaypostError::Unsupported("sent by the node only".into()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Conversation
    // -----------------------------------------------------------------------

    fn ping(&mut self, payload: Vec<u8>) -> Handled {
        // Client ports only answer pings inside a conversation or a relay binding.
        if !self.serves(ServerRole::Primary)
            && self.relay_token.is_none()
            && self.session.status() < ConversationStatus::ConversationStarted
        {
            return Err(WaypostError::BadConversationStatus);
        }
        reply(ResponseBody::Pong {
            payload,
            clock: chrono::Utc::now().timestamp_millis(),
        })
    }

    fn check_in(&mut self, challenge: &[u8], signature: &[u8]) -> Handled {
        let directory = &self.state.directory;
        let identity = self
            .session
            .check_in(challenge, signature, |id| directory.is_hosted(id))?;
        self.state
            .relay
            .register_session(identity, self.id, self.mailbox.clone());
        info!(conn = %self.id, peer = %self.peer, %identity, "Identity checked in");
        reply_ok()
    }

    // -----------------------------------------------------------------------
    // Hosting and profiles
    // -----------------------------------------------------------------------

    fn register_hosting(&mut self, identity_type: &str) -> Handled {
        self.session.proven_identity()?;
        if identity_type.is_empty() || identity_type.len() > self.state.config.search.max_type_bytes {
            return Err(WaypostError::invalid_value("type"));
        }
        self.state
            .directory
            .register_hosting(self.session.client_public_key(), identity_type)?;
        reply_ok()
    }

    fn update_profile(&mut self, update: ProfileUpdate) -> Handled {
        self.session.require(ConversationStatus::CheckedIn)?;
        let identity = self.session.proven_identity()?;
        let config = &self.state.config;

        if update
            .name
            .as_ref()
            .is_some_and(|n| n.len() > config.search.max_name_bytes)
        {
            return Err(WaypostError::invalid_value("name"));
        }
        if let Some(location) = &update.location {
            check_location(location)?;
        }
        if update
            .extra_data
            .as_ref()
            .is_some_and(|d| d.len() > config.search.max_extra_data_bytes)
        {
            return Err(WaypostError::invalid_value("extraData"));
        }
        if update
            .thumbnail
            .as_ref()
            .is_some_and(|t| t.len() > config.hosting.max_thumbnail_bytes)
        {
            return Err(WaypostError::invalid_value("thumbnail"));
        }

        self.state.directory.update_profile(&identity, update)?;
        reply_ok()
    }

    fn cancel_hosting(&mut self, redirect: Option<&[u8]>) -> Handled {
        self.session.require(ConversationStatus::CheckedIn)?;
        let identity = self.session.proven_identity()?;
        let redirect = redirect
            .map(|bytes| {
                IdentityId::from_slice(bytes)
                    .ok_or_else(|| WaypostError::invalid_value("redirectIdentityId"))
            })
            .transpose()?;

        self.state.directory.cancel_hosting(&identity, redirect)?;
        self.state.relay.unregister_session(&identity, self.id);
        self.session.hosting_cancelled();
        reply_ok()
    }

    fn identity_information(
        &mut self,
        identity_id: &[u8],
        include_thumbnail: bool,
        include_application_services: bool,
    ) -> Handled {
        self.session.require(ConversationStatus::ConversationStarted)?;
        let identity =
            IdentityId::from_slice(identity_id).ok_or_else(|| WaypostError::invalid_value("identityId"))?;
        let entry = self
            .state
            .directory
            .get(&identity)
            .ok_or_else(|| WaypostError::NotFound("identity".into()))?;

        let relay = &self.state.relay;
        match entry.status {
            HostingStatus::Hosted => {
                let mut profile = entry.profile;
                if !include_thumbnail {
                    profile.thumbnail = None;
                }
                let services = relay.services(&identity);
                let application_services = if include_application_services {
                    services.clone().unwrap_or_default()
                } else {
                    Vec::new()
                };
                reply(ResponseBody::GetIdentityInformation {
                    public_key: entry.public_key,
                    is_hosted: true,
                    is_online: services.is_some(),
                    profile: Some(profile),
                    redirect_identity_id: None,
                    application_services,
                })
            }
            HostingStatus::Redirected(target) => reply(ResponseBody::GetIdentityInformation {
                public_key: entry.public_key,
                is_hosted: false,
                is_online: false,
                profile: None,
                redirect_identity_id: target.map(|t| t.as_bytes().to_vec()),
                application_services: Vec::new(),
            }),
            HostingStatus::Neighbor => Err(WaypostError::NotFound("identity is not hosted here".into())),
        }
    }

    // -----------------------------------------------------------------------
    // Application services and relay
    // -----------------------------------------------------------------------

    fn check_service_name(&self, name: &str, field: &'static str) -> WaypostResult<()> {
        let max = self.state.config.limits.max_application_service_name_bytes;
        if name.is_empty() || name.len() > max {
            return Err(WaypostError::invalid_value(field));
        }
        Ok(())
    }

    fn add_services(&mut self, names: &[String]) -> Handled {
        self.session.require(ConversationStatus::CheckedIn)?;
        let identity = self.session.proven_identity()?;
        for name in names {
            self.check_service_name(name, "serviceNames")?;
        }
        let max = self.state.config.limits.max_application_services;
        self.state
            .relay
            .add_services(&identity, self.id, names, max)?;
        debug!(conn = %self.id, %identity, added = names.len(), "Application services added");
        reply_ok()
    }

    fn remove_service(&mut self, name: &str) -> Handled {
        self.session.require(ConversationStatus::CheckedIn)?;
        let identity = self.session.proven_identity()?;
        self.check_service_name(name, "serviceName")?;
        self.state.relay.remove_service(&identity, self.id, name)?;
        reply_ok()
    }

    fn call(&mut self, id: u32, identity_id: &[u8], service_name: String) -> Handled {
        let caller = self.session.proven_identity()?;
        let callee =
            IdentityId::from_slice(identity_id).ok_or_else(|| WaypostError::invalid_value("identityId"))?;
        self.check_service_name(&service_name, "serviceName")?;

        info!(conn = %self.id, %caller, %callee, service = %service_name, "Calling application service");
        let relay = self.state.relay.clone();
        let caller_public_key = self.session.client_public_key().to_vec();
        self.deferred.spawn(async move {
            let response = match relay.call(&caller_public_key, callee, &service_name).await {
                Ok(token) => WireResponse::ok_with(ResponseBody::CallIdentityApplicationService {
                    caller_token: token.to_vec(),
                }),
                Err(e) => WireResponse::from(WaypostError::from(e)),
            };
            Deferred::reply(id, response)
        });
        Ok(None)
    }

    fn bind(&mut self, id: u32, token: &[u8]) -> Handled {
        // A connection binds at most one token.
        if self.relay_token.is_some() {
            return Err(WaypostError::NotFound("relay token".into()));
        }
        let token =
            RelayToken::from_slice(token).ok_or_else(|| WaypostError::NotFound("relay token".into()))?;

        let outcome = self.state.relay.bind(&token, self.id, self.mailbox.clone())?;
        self.relay_token = Some(token);
        match outcome {
            BindOutcome::Active => reply_ok(),
            BindOutcome::Pending(pending) => {
                // A failed bind releases the connection so it can bind another token.
                self.deferred.spawn(async move {
                    match pending.wait().await {
                        Ok(()) => Deferred::reply(id, WireResponse::ok()),
                        Err(e) => Deferred {
                            request_id: id,
                            response: WireResponse::from(WaypostError::from(e)),
                            bind_failed: true,
                        },
                    }
                });
                Ok(None)
            }
        }
    }

    fn send_message(&mut self, id: u32, token: &[u8], message: Vec<u8>) -> Handled {
        let bound = self.relay_token.ok_or(WaypostError::BadConversationStatus)?;
        let token = RelayToken::from_slice(token)
            .filter(|t| *t == bound)
            .ok_or_else(|| WaypostError::NotFound("relay token".into()))?;
        self.state
            .relay
            .send_message(self.id, &token, id, message)?;
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    fn search(&mut self, query: SearchQuery) -> Handled {
        self.session.proven_identity()?;
        let max_response_record_count = query.max_response_record_count;
        let compiled = query
            .compile(&self.state.config.search)
            .map_err(WaypostError::from)?;

        let online = self.state.relay.online_identities();
        let candidates = self.state.directory.snapshot(&online);
        let results = compiled.run(&candidates);
        debug!(
            conn = %self.id,
            candidates = candidates.len(),
            matched = results.total_record_count(),
            "Search"
        );

        let body = ResponseBody::Search {
            total_record_count: results.total_record_count(),
            max_response_record_count,
            profiles: results.first_page(max_response_record_count).to_vec(),
        };
        self.search = Some(results);
        reply(body)
    }

    fn search_part(&mut self, record_index: u32, record_count: u32) -> Handled {
        self.session.proven_identity()?;
        let profiles = read_part(self.search.as_ref(), record_index, record_count)
            .map_err(WaypostError::from)?
            .to_vec();
        reply(ResponseBody::SearchPart {
            record_index,
            record_count,
            profiles,
        })
    }
}

fn check_location(location: &EncodedLocation) -> WaypostResult<()> {
    if !location.is_latitude_valid() {
        return Err(WaypostError::invalid_value("latitude"));
    }
    if !location.is_longitude_valid() {
        return Err(WaypostError::invalid_value("longitude"));
    }
    Ok(())
}
