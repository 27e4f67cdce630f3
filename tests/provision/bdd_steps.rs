//! BDD step definitions for the provisioning workflow.

use blockprep::test_support::ProviderCall;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{ProvisionContext, RunResult};
use crate::test_constants::HELPER_GROUP;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("an account with zone \"{zone}\" and image \"{image}\"")]
fn account(provision_context: &ProvisionContext, zone: String, image: String) {
    let provider = provision_context
        .provider()
        .with_zone(&zone, "available")
        .with_image(&image);
    provision_context.provider.replace(provider);
    provision_context.zone.replace(zone);
    provision_context.image_id.replace(image);
}

#[given("a running helper \"{instance_id}\" in zone \"{zone}\"")]
fn running_helper(provision_context: &ProvisionContext, instance_id: String, zone: String) {
    let provider = provision_context.provider().with_group_instance(
        HELPER_GROUP,
        &instance_id,
        &zone,
        "running",
    );
    provision_context.provider.replace(provider);
}

#[given("the disk commands succeed")]
fn disk_commands_succeed(provision_context: &ProvisionContext) {
    provision_context.runner.push_success();
    provision_context.runner.push_success();
}

#[given("partitioning fails with exit code {code}")]
fn partitioning_fails(provision_context: &ProvisionContext, code: i32) {
    provision_context.runner.push_failure(code);
}

#[given("teardown is requested")]
fn teardown_requested(provision_context: &ProvisionContext) {
    provision_context.shutdown_after.replace(true);
}

#[when("I provision a \"{size}\" GB volume at \"{device}\"")]
fn provision(
    provision_context: &ProvisionContext,
    size: String,
    device: String,
) -> Result<(), StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Runtime(err.to_string()))?;
    let controller = provision_context.controller();
    let params = provision_context.params(&size, &device);
    let result = match runtime.block_on(controller.run(&params)) {
        Ok(outcome) => RunResult::Success(outcome),
        Err(failure) => RunResult::Failure {
            stage: failure.stage,
            message: failure.to_string(),
        },
    };
    provision_context.result.replace(Some(result));
    Ok(())
}

fn outcome_of(
    provision_context: &ProvisionContext,
) -> Result<blockprep::ProvisionOutcome, StepError> {
    match provision_context.result.borrow().as_ref() {
        Some(RunResult::Success(outcome)) => Ok(outcome.clone()),
        Some(RunResult::Failure { message, .. }) => Err(StepError::Assertion(format!(
            "expected success, got failure: {message}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

fn count_calls(provision_context: &ProvisionContext, operation: &str) -> usize {
    provision_context.provider().calls_to(operation).len()
}

fn expect(condition: bool, message: impl Into<String>) -> Result<(), StepError> {
    if condition {
        Ok(())
    } else {
        Err(StepError::Assertion(message.into()))
    }
}

#[then("provisioning succeeds")]
fn provisioning_succeeds(provision_context: &ProvisionContext) -> Result<(), StepError> {
    outcome_of(provision_context).map(drop)
}

#[then("provisioning fails while \"{stage}\"")]
fn provisioning_fails(provision_context: &ProvisionContext, stage: String) -> Result<(), StepError> {
    match provision_context.result.borrow().as_ref() {
        Some(RunResult::Failure {
            stage: actual,
            message,
        }) => expect(
            actual.to_string() == stage,
            format!("expected failure while {stage}, got {actual}: {message}"),
        ),
        Some(RunResult::Success(outcome)) => Err(StepError::Assertion(format!(
            "expected failure, got volume {}",
            outcome.volume_id
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("{count} helper instance was launched")]
fn helper_launched(provision_context: &ProvisionContext, count: usize) -> Result<(), StepError> {
    let launched = count_calls(provision_context, "run_instance");
    expect(
        launched == count,
        format!("expected {count} launches, saw {launched}"),
    )
}

#[then("{count} helper instances were launched")]
fn helpers_launched(provision_context: &ProvisionContext, count: usize) -> Result<(), StepError> {
    helper_launched(provision_context, count)
}

#[then("the volume was prepared on \"{instance_id}\"")]
fn prepared_on(provision_context: &ProvisionContext, instance_id: String) -> Result<(), StepError> {
    let outcome = outcome_of(provision_context)?;
    expect(
        outcome.instance_id == instance_id,
        format!("expected {instance_id}, got {}", outcome.instance_id),
    )
}

#[then("the helper is left running")]
fn helper_left_running(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let outcome = outcome_of(provision_context)?;
    expect(outcome.helper_retained, "helper should be retained")?;
    expect(
        count_calls(provision_context, "terminate_instance") == 0,
        "no instance should be terminated",
    )
}

#[then("the helper security group is kept")]
fn group_kept(provision_context: &ProvisionContext) -> Result<(), StepError> {
    expect(
        count_calls(provision_context, "delete_security_group") == 0,
        "security group should not be deleted",
    )?;
    expect(
        provision_context.provider().group_id(HELPER_GROUP).is_some(),
        "security group should exist",
    )
}

#[then("the helper security group is deleted")]
fn group_deleted(provision_context: &ProvisionContext) -> Result<(), StepError> {
    expect(
        provision_context.provider().group_id(HELPER_GROUP).is_none(),
        "security group should be deleted",
    )
}

#[then("the volume is detached")]
fn volume_detached(provision_context: &ProvisionContext) -> Result<(), StepError> {
    expect(
        count_calls(provision_context, "detach_volume") == 1,
        "expected exactly one detach",
    )
}

#[then("the helper is terminated")]
fn helper_terminated(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let calls = provision_context.provider().calls();
    let detach = calls
        .iter()
        .position(|call| matches!(call, ProviderCall::DetachVolume(_)));
    let terminate = calls
        .iter()
        .position(|call| matches!(call, ProviderCall::TerminateInstance(_)));
    match (detach, terminate) {
        (Some(detach), Some(terminate)) => expect(
            detach < terminate,
            "volume must be detached before the helper is terminated",
        ),
        (None, Some(_)) => Ok(()),
        (_, None) => Err(StepError::Assertion(String::from(
            "helper should be terminated",
        ))),
    }
}

#[then("no provider calls were made")]
fn no_provider_calls(provision_context: &ProvisionContext) -> Result<(), StepError> {
    let calls = provision_context.provider().calls();
    expect(calls.is_empty(), format!("unexpected calls: {calls:?}"))
}
