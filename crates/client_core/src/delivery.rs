//! Converges transfer evidence into one [`DeliveryStatus`].
//!
//! Two kinds of evidence exist: the aggregate summary the platform keeps for
//! newer records, and per-recipient detail on older ones. Both paths produce
//! the same ordering so a cached record and a freshly fetched copy agree.

use std::collections::BTreeMap;

use shared::{
    domain::{ConversationId, DeliveryStatus, Identity},
    protocol::{RecipientTransferRecord, TransferHistory, TransferSummary},
};

pub fn resolve_summary(summary: &TransferSummary, recipient_count: usize) -> DeliveryStatus {
    let recipient_count = u32::try_from(recipient_count).unwrap_or(u32::MAX);
    if summary.total_failed > 0 {
        DeliveryStatus::Failed
    } else if summary.total_read_by_recipient >= recipient_count {
        DeliveryStatus::Read
    } else if summary.total_delivered >= recipient_count {
        DeliveryStatus::Delivered
    } else {
        DeliveryStatus::Sent
    }
}

pub fn classify_recipient(record: &RecipientTransferRecord) -> DeliveryStatus {
    if record.is_read_by_recipient {
        DeliveryStatus::Read
    } else if record.latest_successfully_delivered_version_tag.is_some() {
        DeliveryStatus::Delivered
    } else if record.latest_transfer_status.is_failure() {
        DeliveryStatus::Failed
    } else {
        DeliveryStatus::Sent
    }
}

/// Folds per-recipient statuses. An empty set never reads as delivered.
pub fn resolve_per_recipient(statuses: impl IntoIterator<Item = DeliveryStatus>) -> DeliveryStatus {
    let mut seen = 0usize;
    let mut all_read = true;
    let mut all_delivered = true;
    for status in statuses {
        seen += 1;
        match status {
            DeliveryStatus::Failed => return DeliveryStatus::Failed,
            DeliveryStatus::Read => {}
            DeliveryStatus::Delivered => all_read = false,
            DeliveryStatus::Sending | DeliveryStatus::Sent => {
                all_read = false;
                all_delivered = false;
            }
        }
    }
    if seen == 0 {
        DeliveryStatus::Sent
    } else if all_read {
        DeliveryStatus::Read
    } else if all_delivered {
        DeliveryStatus::Delivered
    } else {
        DeliveryStatus::Sent
    }
}

/// Legacy transfer path over the expected recipients; a recipient without a
/// transfer record never got the file and counts as failed.
pub fn resolve_transfer_records(
    records: &BTreeMap<Identity, RecipientTransferRecord>,
    recipients: &[Identity],
) -> DeliveryStatus {
    if recipients.is_empty() {
        return resolve_per_recipient(records.values().map(classify_recipient));
    }
    resolve_per_recipient(recipients.iter().map(|recipient| {
        records
            .get(recipient)
            .map_or(DeliveryStatus::Failed, classify_recipient)
    }))
}

/// Everything known about an outgoing message when it is materialized.
pub struct DeliveryInputs<'a> {
    pub conversation_id: &'a ConversationId,
    pub stored: DeliveryStatus,
    pub details: &'a BTreeMap<Identity, DeliveryStatus>,
    pub history: Option<&'a TransferHistory>,
    /// Recipients of the owning conversation, excluding the current user.
    pub recipients: &'a [Identity],
}

pub fn resolve_outgoing(inputs: &DeliveryInputs<'_>) -> DeliveryStatus {
    if inputs.conversation_id.is_with_yourself() {
        return DeliveryStatus::Read;
    }

    if let Some(history) = inputs.history {
        if let Some(summary) = &history.summary {
            let count = if history.recipients.is_empty() {
                inputs.recipients.len().max(1)
            } else {
                history.recipients.len()
            };
            return resolve_summary(summary, count);
        }
        if !history.recipients.is_empty() {
            return resolve_transfer_records(&history.recipients, inputs.recipients);
        }
    }

    if !inputs.details.is_empty() {
        let stored = inputs.stored;
        if inputs.recipients.is_empty() {
            return resolve_per_recipient(inputs.details.values().copied());
        }
        return resolve_per_recipient(
            inputs
                .recipients
                .iter()
                .map(|recipient| inputs.details.get(recipient).copied().unwrap_or(stored)),
        );
    }

    inputs.stored
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
