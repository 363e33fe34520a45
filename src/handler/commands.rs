use serde::Serialize;
use serde_json::Value;
use validator::Validate;

use crate::{
    config::Config,
    dtos::{
        AdminQueryDto, Command, ErrorResponse, FilterUserDto, FirstContactDto, MembershipEventDto,
        ProgressQueryDto, Response, UserQueryDto,
    },
    service::engine::ReferralEngine,
};

type HandlerResult = Result<Value, ErrorResponse>;

/// Run one JSON command line against the engine and render the JSON reply.
/// Never fails: every problem becomes an `ErrorResponse`.
pub async fn dispatch(engine: &ReferralEngine, config: &Config, line: &str) -> String {
    let reply = match serde_json::from_str::<Command>(line) {
        Ok(command) => {
            let op = command.op();
            match handle(engine, config, command).await {
                Ok(value) => value,
                Err(err) => {
                    if err.status == "error" {
                        tracing::error!("{} failed: {}", op, err.message);
                    } else {
                        tracing::debug!("{} rejected: {}", op, err.message);
                    }
                    to_value(&err)
                }
            }
        }
        Err(e) => to_value(&ErrorResponse::fail(
            "invalid_input",
            "invalid_command",
            e.to_string(),
        )),
    };

    reply.to_string()
}

async fn handle(engine: &ReferralEngine, config: &Config, command: Command) -> HandlerResult {
    match command {
        Command::FirstContact(body) => first_contact(engine, body).await,
        Command::Membership(body) => membership(engine, body).await,
        Command::Status(body) => status(engine, body).await,
        Command::Claim(body) => claim(engine, body).await,
        Command::Stats(body) => stats(engine, config, body).await,
        Command::Referrals(body) => referrals(engine, body).await,
    }
}

fn validated<T: Validate>(body: T) -> Result<T, ErrorResponse> {
    body.validate()
        .map_err(|e| ErrorResponse::fail("invalid_input", "invalid_input", e.to_string()))?;
    Ok(body)
}

fn to_value<T: Serialize>(body: &T) -> Value {
    serde_json::to_value(body).unwrap_or(Value::Null)
}

async fn first_contact(engine: &ReferralEngine, body: FirstContactDto) -> HandlerResult {
    let body = validated(body)?;

    let contact = engine
        .on_first_contact(body.user_id, &body.attrs(), body.referral_code.as_deref())
        .await?;

    Ok(to_value(&Response::success(
        "first_contact",
        serde_json::json!({
            "user": FilterUserDto::filter_user(&contact.user),
            "created": contact.created,
            "referral": contact.referral,
        }),
    )))
}

async fn membership(engine: &ReferralEngine, body: MembershipEventDto) -> HandlerResult {
    let body = validated(body)?;
    let outcome = engine.on_membership_event((&body).into()).await?;
    Ok(to_value(&Response::success("membership", outcome)))
}

async fn status(engine: &ReferralEngine, body: ProgressQueryDto) -> HandlerResult {
    let body = validated(body)?;
    let target = body.target.unwrap_or(engine.referral_target());
    let progress = engine.on_status_query(body.user_id, target).await?;
    Ok(to_value(&Response::success("status", progress)))
}

async fn claim(engine: &ReferralEngine, body: ProgressQueryDto) -> HandlerResult {
    let body = validated(body)?;
    let target = body.target.unwrap_or(engine.referral_target());
    let receipt = engine.on_claim_request(body.user_id, target).await?;
    Ok(to_value(&Response::success("claim", receipt)))
}

async fn stats(engine: &ReferralEngine, config: &Config, body: AdminQueryDto) -> HandlerResult {
    let body = validated(body)?;
    if !config.is_admin(body.requester_id) {
        tracing::warn!("Non-admin {} asked for stats", body.requester_id);
        return Err(ErrorResponse::fail(
            "precondition_failed",
            "forbidden",
            "stats are only available to admins",
        ));
    }

    let stats = engine.stats().await?;
    Ok(to_value(&Response::success("stats", stats)))
}

async fn referrals(engine: &ReferralEngine, body: UserQueryDto) -> HandlerResult {
    let body = validated(body)?;
    let referrals = engine.list_referrals(body.user_id).await?;
    let referred_by = engine.get_referral_by_referred(body.user_id).await?;

    Ok(to_value(&Response::success(
        "referrals",
        serde_json::json!({
            "referred_by": referred_by.map(|edge| edge.referrer_id),
            "results": referrals.len(),
            "referrals": referrals,
        }),
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{db::DBClient, service::notification::testing::RecordingNotifier};

    async fn setup() -> (ReferralEngine, Config) {
        let db = Arc::new(DBClient::in_memory().await.unwrap());
        let config = Config {
            referral_target: 1,
            admin_user_ids: vec![100],
            ..Config::default()
        };
        let engine = ReferralEngine::builder(db, &config)
            .notifier(Arc::new(RecordingNotifier::default()))
            .build();
        (engine, config)
    }

    async fn call(engine: &ReferralEngine, config: &Config, line: &str) -> Value {
        serde_json::from_str(&dispatch(engine, config, line).await).unwrap()
    }

    #[tokio::test]
    async fn full_referral_round_trip() {
        let (engine, config) = setup().await;

        let reply = call(
            &engine,
            &config,
            r#"{"op":"first_contact","user_id":1,"first_name":"Ada"}"#,
        )
        .await;
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["data"]["user"]["display_name"], "Ada");
        let code = reply["data"]["user"]["referral_code"].as_str().unwrap().to_string();

        let line = serde_json::json!({"op": "first_contact", "user_id": 2, "referral_code": code});
        let reply = call(&engine, &config, &line.to_string()).await;
        assert_eq!(reply["data"]["referral"]["status"], "attributed");
        assert_eq!(reply["data"]["user"]["referred_by"], 1);

        let reply = call(
            &engine,
            &config,
            r#"{"op":"membership","user_id":2,"event":"joined"}"#,
        )
        .await;
        assert_eq!(reply["data"]["activated_referrer"], 1);

        let reply = call(&engine, &config, r#"{"op":"status","user_id":1}"#).await;
        assert_eq!(reply["data"]["target_reached"], true);

        let reply = call(&engine, &config, r#"{"op":"claim","user_id":1}"#).await;
        assert_eq!(reply["status"], "success");
        let reply = call(&engine, &config, r#"{"op":"claim","user_id":1}"#).await;
        assert_eq!(reply["status"], "fail");
        assert_eq!(reply["code"], "already_claimed");

        let reply = call(&engine, &config, r#"{"op":"referrals","user_id":1}"#).await;
        assert_eq!(reply["data"]["results"], 1);
        assert_eq!(reply["data"]["referrals"][0]["is_active"], true);
    }

    #[tokio::test]
    async fn stats_are_admin_only() {
        let (engine, config) = setup().await;

        let reply = call(&engine, &config, r#"{"op":"stats","requester_id":5}"#).await;
        assert_eq!(reply["code"], "forbidden");

        let reply = call(&engine, &config, r#"{"op":"stats","requester_id":100}"#).await;
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["data"]["total_users"], 0);
    }

    #[tokio::test]
    async fn bad_input_is_reported_as_invalid() {
        let (engine, config) = setup().await;

        let reply = call(&engine, &config, "not json").await;
        assert_eq!(reply["code"], "invalid_command");

        let reply = call(&engine, &config, r#"{"op":"status","user_id":0}"#).await;
        assert_eq!(reply["kind"], "invalid_input");

        let reply = call(
            &engine,
            &config,
            r#"{"op":"first_contact","user_id":3,"referral_code":"no spaces"}"#,
        )
        .await;
        assert_eq!(reply["status"], "fail");
    }

    #[tokio::test]
    async fn lowest_target_reports_progress_without_overflow() {
        let (engine, config) = setup().await;

        let reply = call(&engine, &config, r#"{"op":"first_contact","user_id":1}"#).await;
        let code = reply["data"]["user"]["referral_code"].as_str().unwrap().to_string();
        let line = serde_json::json!({"op": "first_contact", "user_id": 2, "referral_code": code});
        call(&engine, &config, &line.to_string()).await;
        call(&engine, &config, r#"{"op":"membership","user_id":2,"event":"joined"}"#).await;

        let line = serde_json::json!({"op": "status", "user_id": 1, "target": i64::MIN});
        let reply = call(&engine, &config, &line.to_string()).await;
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["data"]["active_referrals"], 1);
        assert_eq!(reply["data"]["remaining"], 0);
        assert_eq!(reply["data"]["progress_percentage"], 0.0);
    }
}
