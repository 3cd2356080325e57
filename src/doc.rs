//! OpenAPI / Swagger documentation definitions.
use crate::types::{
    CreateGroupRequest, CreateGroupResponse, CreatePollRequest, GroupMembersResponse, LoginMessage,
    MeResponse, NonceResponse, OptionResult, PollOption, PollResponse, PollStatus, ResultsResponse,
    UpdatePollRequest, VerifyRequest, VerifyResponse,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_doc,
        create_poll_doc,
        list_polls_doc,
        get_poll_doc,
        update_poll_doc,
        create_group_doc,
        results_doc,
        group_members_doc,
        nonce_doc,
        verify_doc,
        me_doc
    ),
    components(
        schemas(
            CreatePollRequest,
            UpdatePollRequest,
            CreateGroupRequest,
            CreateGroupResponse,
            PollResponse,
            PollOption,
            PollStatus,
            OptionResult,
            ResultsResponse,
            GroupMembersResponse,
            NonceResponse,
            LoginMessage,
            VerifyRequest,
            VerifyResponse,
            MeResponse
        )
    ),
    tags(
        (name = "votara", description = "Votara coordinator API")
    )
)]
pub struct ApiDoc;

// Doc-only shim functions so utoipa can pick up signatures.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "OK"))
)]
pub async fn health_doc() {}

#[utoipa::path(
    post,
    path = "/polls",
    request_body = CreatePollRequest,
    responses((status = 200, body = PollResponse))
)]
pub async fn create_poll_doc() {}

#[utoipa::path(
    get,
    path = "/polls",
    params(
        ("page" = Option<i64>, Query, description = "Page, 1-based"),
        ("limit" = Option<i64>, Query, description = "Page size, clamped to 50"),
        ("status" = Option<String>, Query, description = "DRAFT | ACTIVE | ENDED"),
        ("creator" = Option<String>, Query, description = "Creator address filter")
    ),
    responses((status = 200, body = [PollResponse]))
)]
pub async fn list_polls_doc() {}

#[utoipa::path(
    get,
    path = "/polls/{id}",
    params(("id" = String, Path, description = "Poll id (0x-prefixed 32 bytes)")),
    responses((status = 200, body = PollResponse))
)]
pub async fn get_poll_doc() {}

#[utoipa::path(
    put,
    path = "/polls/{id}",
    params(("id" = String, Path, description = "Poll id")),
    request_body = UpdatePollRequest,
    responses((status = 200, body = PollResponse))
)]
pub async fn update_poll_doc() {}

#[utoipa::path(
    post,
    path = "/polls/{id}/create-group",
    params(("id" = String, Path, description = "Poll id")),
    request_body = CreateGroupRequest,
    responses((status = 200, body = CreateGroupResponse))
)]
pub async fn create_group_doc() {}

#[utoipa::path(
    get,
    path = "/polls/{id}/results",
    params(("id" = String, Path, description = "Poll id")),
    responses((status = 200, body = ResultsResponse))
)]
pub async fn results_doc() {}

#[utoipa::path(
    get,
    path = "/polls/{id}/group-members",
    params(("id" = String, Path, description = "Poll id")),
    responses((status = 200, body = GroupMembersResponse))
)]
pub async fn group_members_doc() {}

#[utoipa::path(
    get,
    path = "/auth/nonce",
    responses((status = 200, body = NonceResponse))
)]
pub async fn nonce_doc() {}

#[utoipa::path(
    post,
    path = "/auth/verify",
    request_body = VerifyRequest,
    responses((status = 200, body = VerifyResponse))
)]
pub async fn verify_doc() {}

#[utoipa::path(
    get,
    path = "/auth/me",
    responses((status = 200, body = MeResponse))
)]
pub async fn me_doc() {}
