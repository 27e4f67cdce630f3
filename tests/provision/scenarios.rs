//! BDD scenarios for the provisioning workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ProvisionContext, provision_context};

#[scenario(
    path = "tests/features/provision.feature",
    name = "Prepare a volume on a freshly launched helper"
)]
fn scenario_fresh_helper(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Reuse a running helper"
)]
fn scenario_reuse_helper(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Partitioning failure rolls back"
)]
fn scenario_partition_failure(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Tear everything down after success"
)]
fn scenario_teardown(provision_context: ProvisionContext) {
    drop(provision_context);
}

#[scenario(
    path = "tests/features/provision.feature",
    name = "Reject an invalid size before touching the account"
)]
fn scenario_invalid_size(provision_context: ProvisionContext) {
    drop(provision_context);
}
