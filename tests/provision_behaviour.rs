//! Behavioural scenarios for `blockprep create`.

#[path = "common/test_constants.rs"]
mod test_constants;

mod provision;
