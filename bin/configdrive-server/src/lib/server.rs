// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP surface of the config-drive service.
//!
//! Administrative callers register instances, push lifecycle/topology
//! notifications, and manage userdata/passwords/keys; the guest-facing
//! device layer fetches the current drive image for an instance's default
//! attachment.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseCreated,
    HttpResponseDeleted, HttpResponseOk, HttpResponseUpdatedNoContent, Path,
    RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::Deserialize;
use slog::Logger;

use crate::service::{ConfigDriveService, NewInstance, ServiceError};
use configdrive::ledger::LedgerError;
use configdrive::nic::ResolverError;
use configdrive::store::StoreError;
use configdrive_types::{
    AttachmentId, DriveDescription, DriveFileDescription,
    DriveVersionResponse, InstanceEnsureBody, InstanceEnsureResponse,
    InstanceId, InstanceStateRequested, NetworkId, PasswordResetResponse,
    ProviderStateBody, SshKeyUpdateBody, TemplateUpdateBody, TopologyChange,
    UserDataUpdateBody,
};

/// Shared context for API request handlers.
pub struct ServiceContext {
    pub service: ConfigDriveService,
    pub log: Logger,
}

impl From<ServiceError> for HttpError {
    fn from(e: ServiceError) -> Self {
        match &e {
            ServiceError::UnknownInstance(_)
            | ServiceError::Store(StoreError::NotAttached(_))
            | ServiceError::Store(StoreError::StaleAttachment(..))
            | ServiceError::Resolver(ResolverError::UnknownInstance(_))
            | ServiceError::Resolver(ResolverError::UnknownAttachment(..))
            | ServiceError::Ledger(LedgerError::UnknownInstance(_)) => {
                HttpError::for_not_found(None, e.to_string())
            }
            ServiceError::AlreadyRegistered(_)
            | ServiceError::Denied(_)
            | ServiceError::Content(_)
            | ServiceError::Ledger(LedgerError::NotPasswordEnabled(_))
            | ServiceError::Resolver(_)
            | ServiceError::ProviderDisabled(_) => {
                HttpError::for_bad_request(None, e.to_string())
            }
            ServiceError::Unavailable(_) => {
                HttpError::for_unavail(None, e.to_string())
            }
            ServiceError::BuildFailed(_) | ServiceError::Persist(_) => {
                HttpError::for_internal_error(e.to_string())
            }
        }
    }
}

#[derive(Deserialize, JsonSchema)]
struct InstancePathParams {
    instance_id: InstanceId,
}

#[derive(Deserialize, JsonSchema)]
struct DrivePathParams {
    instance_id: InstanceId,
    attachment_id: AttachmentId,
}

#[derive(Deserialize, JsonSchema)]
struct NetworkPathParams {
    network_id: NetworkId,
}

fn decode_user_data(data: Option<&str>) -> Result<Vec<u8>, HttpError> {
    match data {
        None => Ok(Vec::new()),
        Some(encoded) => BASE64.decode(encoded).map_err(|e| {
            HttpError::for_bad_request(
                None,
                format!("userdata is not valid base64: {e}"),
            )
        }),
    }
}

#[endpoint {
    method = PUT,
    path = "/instances/{instance_id}",
}]
async fn instance_register(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<InstancePathParams>,
    request: TypedBody<InstanceEnsureBody>,
) -> Result<HttpResponseCreated<InstanceEnsureResponse>, HttpError> {
    let ctx = rqctx.context();
    let body = request.into_inner();
    let user_data = decode_user_data(body.user_data.as_deref())?;

    let registered = ctx
        .service
        .register_instance(NewInstance {
            id: path_params.into_inner().instance_id,
            name: body.name,
            zone: body.zone,
            availability_zone: body.availability_zone,
            user_data,
            ssh_public_key: body.ssh_public_key,
            password_enabled: body.password_enabled,
            nics: body.nics,
        })
        .await?;

    Ok(HttpResponseCreated(InstanceEnsureResponse {
        version: registered.version,
        password: registered.password,
    }))
}

#[endpoint {
    method = DELETE,
    path = "/instances/{instance_id}",
}]
async fn instance_expunge(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<InstancePathParams>,
) -> Result<HttpResponseDeleted, HttpError> {
    let ctx = rqctx.context();
    ctx.service
        .expunge_instance(path_params.into_inner().instance_id)
        .await?;
    Ok(HttpResponseDeleted())
}

#[endpoint {
    method = PUT,
    path = "/instances/{instance_id}/state",
}]
async fn instance_state_put(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<InstancePathParams>,
    request: TypedBody<InstanceStateRequested>,
) -> Result<HttpResponseOk<DriveVersionResponse>, HttpError> {
    let ctx = rqctx.context();
    let version = ctx
        .service
        .request_state(
            path_params.into_inner().instance_id,
            request.into_inner(),
        )
        .await?;
    Ok(HttpResponseOk(DriveVersionResponse { version }))
}

#[endpoint {
    method = PUT,
    path = "/instances/{instance_id}/userdata",
}]
async fn instance_userdata_put(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<InstancePathParams>,
    request: TypedBody<UserDataUpdateBody>,
) -> Result<HttpResponseOk<DriveVersionResponse>, HttpError> {
    let ctx = rqctx.context();
    let body = request.into_inner();
    let user_data = decode_user_data(Some(&body.user_data))?;
    let version = ctx
        .service
        .update_user_data(
            path_params.into_inner().instance_id,
            user_data,
        )
        .await?;
    Ok(HttpResponseOk(DriveVersionResponse { version }))
}

#[endpoint {
    method = POST,
    path = "/instances/{instance_id}/password",
}]
async fn instance_password_reset(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<InstancePathParams>,
) -> Result<HttpResponseOk<PasswordResetResponse>, HttpError> {
    let ctx = rqctx.context();
    let (password, version) = ctx
        .service
        .reset_password(path_params.into_inner().instance_id)
        .await?;
    Ok(HttpResponseOk(PasswordResetResponse { password, version }))
}

#[endpoint {
    method = PUT,
    path = "/instances/{instance_id}/ssh-key",
}]
async fn instance_ssh_key_put(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<InstancePathParams>,
    request: TypedBody<SshKeyUpdateBody>,
) -> Result<HttpResponseOk<DriveVersionResponse>, HttpError> {
    let ctx = rqctx.context();
    let version = ctx
        .service
        .update_ssh_key(
            path_params.into_inner().instance_id,
            request.into_inner().public_key,
        )
        .await?;
    Ok(HttpResponseOk(DriveVersionResponse { version }))
}

#[endpoint {
    method = PUT,
    path = "/instances/{instance_id}/template",
}]
async fn instance_template_put(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<InstancePathParams>,
    request: TypedBody<TemplateUpdateBody>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    ctx.service
        .set_template_password_enabled(
            path_params.into_inner().instance_id,
            request.into_inner().password_enabled,
        )
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/instances/{instance_id}/nics",
}]
async fn instance_nics_put(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<InstancePathParams>,
    request: TypedBody<TopologyChange>,
) -> Result<HttpResponseOk<DriveVersionResponse>, HttpError> {
    let ctx = rqctx.context();
    let version = ctx
        .service
        .apply_topology_change(
            path_params.into_inner().instance_id,
            request.into_inner(),
        )
        .await?;
    Ok(HttpResponseOk(DriveVersionResponse { version }))
}

#[endpoint {
    method = GET,
    path = "/instances/{instance_id}/drive/{attachment_id}",
}]
async fn instance_drive_get(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<DrivePathParams>,
) -> Result<HttpResponseOk<DriveDescription>, HttpError> {
    let ctx = rqctx.context();
    let path = path_params.into_inner();
    let image =
        ctx.service.drive(path.instance_id, path.attachment_id)?;
    Ok(HttpResponseOk(DriveDescription {
        instance_id: image.instance_id,
        attachment_id: image.attachment_id,
        version: image.version,
        files: image
            .files
            .files()
            .iter()
            .map(|f| DriveFileDescription {
                name: f.name.clone(),
                size: f.data.len() as u64,
            })
            .collect(),
        image: BASE64.encode(&image.bytes),
    }))
}

#[endpoint {
    method = PUT,
    path = "/networks/{network_id}/provider",
}]
async fn network_provider_put(
    rqctx: RequestContext<Arc<ServiceContext>>,
    path_params: Path<NetworkPathParams>,
    request: TypedBody<ProviderStateBody>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    ctx.service.set_provider_state(
        path_params.into_inner().network_id,
        request.into_inner().enabled,
    );
    Ok(HttpResponseUpdatedNoContent())
}

/// Returns a Dropshot [`ApiDescription`] object to launch a server.
pub fn api() -> ApiDescription<Arc<ServiceContext>> {
    let mut api = ApiDescription::new();
    api.register(instance_register).unwrap();
    api.register(instance_expunge).unwrap();
    api.register(instance_state_put).unwrap();
    api.register(instance_userdata_put).unwrap();
    api.register(instance_password_reset).unwrap();
    api.register(instance_ssh_key_put).unwrap();
    api.register(instance_template_put).unwrap();
    api.register(instance_nics_put).unwrap();
    api.register(instance_drive_get).unwrap();
    api.register(network_provider_put).unwrap();

    api
}
