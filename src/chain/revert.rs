//! Human-readable guidance for known contract custom errors.

use super::ChainError;

/// Render a chain error for the user.
///
/// Known custom errors are mapped to actionable messages; unknown reverts and
/// other errors pass through unchanged.
#[must_use]
pub fn describe(error: &ChainError) -> String {
    match error {
        ChainError::Reverted { name, args } => decode_custom_error(name, args)
            .map_or_else(|| error.to_string(), |hint| format!("{hint} ({error})")),
        other => other.to_string(),
    }
}

fn decode_custom_error(name: &str, args: &[String]) -> Option<String> {
    let arg = |i: usize| args.get(i).map_or("?", String::as_str);
    let hint = match name {
        "LedgerNotExists" => format!(
            "Ledger for {} does not exist; create one first with add_ledger",
            arg(0)
        ),
        "LedgerExists" => format!(
            "Ledger for {} already exists; use deposit_fund to add funds",
            arg(0)
        ),
        "InsufficientBalance" => format!(
            "Insufficient balance for {}; deposit more funds into the ledger first",
            arg(0)
        ),
        "AccountNotExists" => format!(
            "No sub-account for user {} with provider {}; transfer funds to the provider first",
            arg(0),
            arg(1)
        ),
        "AccountExists" => format!(
            "Sub-account for user {} with provider {} already exists",
            arg(0),
            arg(1)
        ),
        "ServiceNotExists" => format!("Provider {} has no registered service", arg(0)),
        "InvalidNonce" => format!(
            "Request nonce {} is not above the last settled nonce {}",
            arg(0),
            arg(1)
        ),
        "InvalidSignature" => {
            "Request signature does not match the user's settlement key".to_string()
        }
        "DeliverableNotExists" => format!(
            "Provider {} has no deliverable at index {}",
            arg(0),
            arg(1)
        ),
        "DeliverableAlreadyAcknowledged" => format!(
            "Deliverable {} from provider {} is already acknowledged",
            arg(1),
            arg(0)
        ),
        "LedgerNotEmpty" => format!(
            "Ledger for {} still holds sub-account funds; retrieve them before deleting",
            arg(0)
        ),
        _ => return None,
    };
    Some(hint)
}
