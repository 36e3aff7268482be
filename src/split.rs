use crate::allocation::{compute_portion, compute_saving, compute_total, ShareEntry};
use crate::error::{ApiError, ApiResult};
use crate::schemas::{Event, Payment};
use crate::store;
use bson::doc;
use chrono::{NaiveDate, Utc};
use futures::stream::TryStreamExt;
use mongodb::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Which of the two coupled fields is currently recomputed by the engine.
/// The other one is the field the user is steering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Driven {
    Saving,
    Portion,
}

/// Working copy of one event edit session. The caller owns it for the whole
/// session and submits it as a single atomic commit; cancelling is simply
/// dropping it. Nothing here touches the store.
#[derive(Clone, Debug)]
pub struct SplitDraft {
    pub name: String,
    pub description: Option<String>,
    pub delivery: NaiveDate,
    pub income: i64,
    pub saving: Decimal,
    pub portion: Decimal,
    pub driven: Driven,
    pub entries: BTreeMap<String, ShareEntry>,
}

impl SplitDraft {
    /// Fresh draft for a new event, no payees attached yet.
    pub fn new(
        name: String,
        description: Option<String>,
        delivery: NaiveDate,
        income: i64,
    ) -> SplitDraft {
        let mut draft = SplitDraft {
            name,
            description,
            delivery,
            income,
            saving: Decimal::ZERO,
            portion: Decimal::ZERO,
            driven: Driven::Portion,
            entries: BTreeMap::new(),
        };
        draft.recompute();
        draft
    }

    /// Opens an edit session over a committed event and its payments.
    pub fn from_event(event: &Event, payments: &[Payment]) -> SplitDraft {
        let entries = payments
            .iter()
            .map(|p| {
                (
                    p.payee_id.clone(),
                    ShareEntry {
                        factor: p.factor,
                        extra: p.extra,
                    },
                )
            })
            .collect();
        let mut draft = SplitDraft {
            name: event.name.clone(),
            description: event.description.clone(),
            delivery: event.delivery,
            income: event.income,
            saving: Decimal::from(event.saving),
            portion: Decimal::ZERO,
            driven: Driven::Portion,
            entries,
        };
        draft.recompute();
        draft
    }

    fn entry_list(&self) -> Vec<ShareEntry> {
        self.entries.values().copied().collect()
    }

    fn recompute(&mut self) {
        let income = Decimal::from(self.income);
        let entries = self.entry_list();
        match self.driven {
            Driven::Portion => self.portion = compute_portion(self.saving, &entries, income),
            Driven::Saving => self.saving = compute_saving(self.portion, &entries, income),
        }
    }

    pub fn set_income(&mut self, income: i64) {
        self.income = income;
        self.recompute();
    }

    pub fn set_entry(&mut self, payee_id: &str, entry: ShareEntry) {
        self.entries.insert(payee_id.to_string(), entry);
        self.recompute();
    }

    pub fn remove_entry(&mut self, payee_id: &str) {
        self.entries.remove(payee_id);
        self.recompute();
    }

    /// The user steers the saving target, the portion becomes derived.
    pub fn set_saving(&mut self, saving: Decimal) {
        self.saving = saving;
        self.driven = Driven::Portion;
        self.recompute();
    }

    /// The user steers the per-unit share, the saving becomes derived.
    pub fn set_portion(&mut self, portion: Decimal) {
        self.portion = portion;
        self.driven = Driven::Saving;
        self.recompute();
    }

    /// Gate in front of every commit. Violations are reported against the
    /// field that broke, with the working copy left untouched for
    /// correction.
    pub fn validate(&self) -> ApiResult<()> {
        if self.income < 0 {
            return Err(ApiError::BadRequest(
                "income must not be negative".to_string(),
            ));
        }
        for (payee_id, entry) in &self.entries {
            if entry.factor < 0 {
                return Err(ApiError::BadRequest(format!(
                    "factor for payee {payee_id} must not be negative"
                )));
            }
            if entry.extra < 0 {
                return Err(ApiError::BadRequest(format!(
                    "extra for payee {payee_id} must not be negative"
                )));
            }
        }
        if self.saving > Decimal::from(self.income) {
            return Err(ApiError::BadRequest(
                "saving must not exceed income".to_string(),
            ));
        }
        if self.saving < Decimal::ZERO {
            return Err(ApiError::BadRequest(
                "saving would become negative".to_string(),
            ));
        }
        if self.portion < Decimal::ZERO {
            return Err(ApiError::BadRequest(
                "portion would become negative".to_string(),
            ));
        }
        Ok(())
    }

    // Stored saving is a whole minor unit; a portion-steered session may
    // carry sub-unit precision, which truncates down on commit.
    fn saving_minor_units(&self) -> Option<i64> {
        self.saving.floor().to_i64()
    }
}

fn build_rows(
    draft: &SplitDraft,
    account_id: &str,
    event_id: String,
    created_at: chrono::DateTime<Utc>,
) -> ApiResult<(Event, Vec<Payment>)> {
    let saving = draft
        .saving_minor_units()
        .ok_or_else(|| ApiError::BadRequest("saving is out of range".to_string()))?;
    let now = Utc::now();
    let event = Event {
        id: event_id,
        account_id: account_id.to_string(),
        name: draft.name.clone(),
        description: draft.description.clone(),
        income: draft.income,
        saving,
        delivery: draft.delivery,
        created_at,
        updated_at: now,
    };
    let payments = draft
        .entries
        .iter()
        .map(|(payee_id, entry)| Payment {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            event_id: event.id.clone(),
            payee_id: payee_id.clone(),
            factor: entry.factor,
            extra: entry.extra,
            created_at: now,
            updated_at: now,
        })
        .collect();
    Ok((event, payments))
}

async fn check_payees(client: &Client, account_id: &str, draft: &SplitDraft) -> ApiResult<()> {
    for payee_id in draft.entries.keys() {
        let known = store::payees(client)
            .find_one(doc! { "id": payee_id, "account_id": account_id }, None)
            .await?
            .is_some();
        if !known {
            return Err(ApiError::NotFound("payee"));
        }
    }
    Ok(())
}

/// Commits a new event with all its payments in one transaction.
pub async fn commit_new(client: &Client, account_id: &str, draft: &SplitDraft) -> ApiResult<String> {
    draft.validate()?;
    check_payees(client, account_id, draft).await?;
    let (event, payments) = build_rows(draft, account_id, Uuid::new_v4().to_string(), Utc::now())?;

    let mut session = client.start_session(None).await?;
    session.start_transaction(None).await?;
    let result: mongodb::error::Result<()> = async {
        store::events(client)
            .insert_one_with_session(&event, None, &mut session)
            .await?;
        for payment in &payments {
            store::payments(client)
                .insert_one_with_session(payment, None, &mut session)
                .await?;
        }
        Ok(())
    }
    .await;
    store::commit_or_abort(session, result).await?;
    tracing::info!(account_id, event_id = %event.id, payments = payments.len(), "event committed");
    Ok(event.id)
}

/// Replaces an event and its full payment set in one transaction, so income
/// and factors can never be observed half-updated.
pub async fn commit_update(
    client: &Client,
    account_id: &str,
    existing: &Event,
    draft: &SplitDraft,
) -> ApiResult<()> {
    draft.validate()?;
    check_payees(client, account_id, draft).await?;
    let (event, payments) = build_rows(draft, account_id, existing.id.clone(), existing.created_at)?;

    let mut session = client.start_session(None).await?;
    session.start_transaction(None).await?;
    let result: mongodb::error::Result<()> = async {
        store::events(client)
            .replace_one_with_session(
                doc! { "id": &event.id, "account_id": account_id },
                &event,
                None,
                &mut session,
            )
            .await?;
        store::payments(client)
            .delete_many_with_session(doc! { "event_id": &event.id }, None, &mut session)
            .await?;
        for payment in &payments {
            store::payments(client)
                .insert_one_with_session(payment, None, &mut session)
                .await?;
        }
        Ok(())
    }
    .await;
    store::commit_or_abort(session, result).await?;
    tracing::info!(account_id, event_id = %event.id, payments = payments.len(), "event replaced");
    Ok(())
}

/// Drops an event together with all its payments, atomically.
pub async fn delete_split(client: &Client, account_id: &str, event_id: &str) -> ApiResult<()> {
    store::events(client)
        .find_one(doc! { "id": event_id, "account_id": account_id }, None)
        .await?
        .ok_or(ApiError::NotFound("event"))?;

    let mut session = client.start_session(None).await?;
    session.start_transaction(None).await?;
    let result: mongodb::error::Result<()> = async {
        store::events(client)
            .delete_one_with_session(doc! { "id": event_id }, None, &mut session)
            .await?;
        store::payments(client)
            .delete_many_with_session(doc! { "event_id": event_id }, None, &mut session)
            .await?;
        Ok(())
    }
    .await;
    store::commit_or_abort(session, result).await?;
    tracing::info!(account_id, event_id, "event deleted");
    Ok(())
}

pub async fn payments_of(client: &Client, event_id: &str) -> ApiResult<Vec<Payment>> {
    Ok(store::payments(client)
        .find(doc! { "event_id": event_id }, None)
        .await?
        .try_collect()
        .await?)
}

/// Read-only projection of an event with its derived per-unit share.
#[derive(Debug, Serialize)]
pub struct EventView {
    #[serde(flatten)]
    pub event: Event,
    pub portion: Decimal,
}

pub fn event_view(event: Event, payments: &[Payment]) -> EventView {
    let draft = SplitDraft::from_event(&event, payments);
    EventView {
        portion: draft.portion,
        event,
    }
}

/// Read-only projection of one payment with its derived total.
#[derive(Debug, Serialize)]
pub struct PaymentView {
    #[serde(flatten)]
    pub payment: Payment,
    pub total: Decimal,
}

pub fn payment_views(event: &Event, payments: Vec<Payment>) -> Vec<PaymentView> {
    let entries: Vec<ShareEntry> = payments
        .iter()
        .map(|p| ShareEntry {
            factor: p.factor,
            extra: p.extra,
        })
        .collect();
    let portion = compute_portion(
        Decimal::from(event.saving),
        &entries,
        Decimal::from(event.income),
    );
    payments
        .into_iter()
        .map(|payment| PaymentView {
            total: compute_total(portion, payment.factor, payment.extra),
            payment,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 14).unwrap()
    }

    fn draft_with_two_payees(income: i64) -> SplitDraft {
        let mut draft = SplitDraft::new("august pool".to_string(), None, date(), income);
        draft.set_entry("p-1", ShareEntry { factor: 1, extra: 0 });
        draft.set_entry("p-2", ShareEntry { factor: 1, extra: 0 });
        draft
    }

    #[test]
    fn fresh_draft_drives_portion_from_a_zero_saving() {
        let draft = draft_with_two_payees(1000);
        assert_eq!(draft.driven, Driven::Portion);
        assert_eq!(draft.saving, dec!(0));
        assert_eq!(draft.portion, dec!(500.00));
    }

    #[test]
    fn steering_portion_makes_saving_the_derived_field() {
        let mut draft = draft_with_two_payees(1000);
        draft.set_entry("p-1", ShareEntry { factor: 1, extra: 100 });
        draft.set_portion(dec!(400));
        assert_eq!(draft.driven, Driven::Saving);
        // totals are 500 and 400, the rest is saved
        assert_eq!(draft.saving, dec!(100.00));

        // further income edits keep recomputing saving, not portion
        draft.set_income(1100);
        assert_eq!(draft.portion, dec!(400));
        assert_eq!(draft.saving, dec!(200.00));
    }

    #[test]
    fn steering_saving_recomputes_the_portion() {
        let mut draft = draft_with_two_payees(1000);
        draft.set_saving(dec!(200));
        assert_eq!(draft.driven, Driven::Portion);
        assert_eq!(draft.portion, dec!(400.00));

        draft.set_entry("p-3", ShareEntry { factor: 2, extra: 0 });
        assert_eq!(draft.portion, dec!(200.00));
    }

    #[test]
    fn removing_an_entry_frees_its_share() {
        let mut draft = draft_with_two_payees(1000);
        draft.remove_entry("p-2");
        assert_eq!(draft.portion, dec!(1000.00));
    }

    #[test]
    fn saving_above_income_fails_validation() {
        let mut draft = draft_with_two_payees(500);
        draft.set_saving(dec!(600));
        let err = draft.validate().unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(err.to_string().contains("saving"));
    }

    #[test]
    fn negative_derived_saving_fails_validation() {
        let mut draft = draft_with_two_payees(1000);
        // totals alone exceed the income
        draft.set_portion(dec!(600));
        assert_eq!(draft.saving, dec!(-200.00));
        let err = draft.validate().unwrap_err();
        assert!(err.to_string().contains("saving"));
    }

    #[test]
    fn negative_factor_fails_validation_naming_the_payee() {
        let mut draft = draft_with_two_payees(1000);
        draft.set_entry("p-2", ShareEntry { factor: -1, extra: 0 });
        let err = draft.validate().unwrap_err();
        assert!(err.to_string().contains("p-2"));
    }

    #[test]
    fn extra_only_entries_stay_valid() {
        let mut draft = SplitDraft::new("flowers".to_string(), None, date(), 500);
        draft.set_entry("p-1", ShareEntry { factor: 0, extra: 300 });
        draft.set_saving(dec!(100));
        assert!(draft.validate().is_ok());
        assert_eq!(draft.portion, dec!(100.00));
    }

    #[test]
    fn portion_steered_saving_truncates_to_whole_minor_units() {
        let mut draft = SplitDraft::new("thirds".to_string(), None, date(), 1000);
        for id in ["p-1", "p-2", "p-3"] {
            draft.set_entry(id, ShareEntry { factor: 1, extra: 0 });
        }
        draft.set_portion(dec!(333.33));
        assert_eq!(draft.saving, dec!(0.01));
        assert_eq!(draft.saving_minor_units(), Some(0));
    }

    #[test]
    fn edit_session_opens_on_the_committed_state() {
        let now = Utc::now();
        let event = Event {
            id: "e-1".to_string(),
            account_id: "acc-1".to_string(),
            name: "september pool".to_string(),
            description: None,
            income: 1000,
            saving: 0,
            delivery: date(),
            created_at: now,
            updated_at: now,
        };
        let payments = vec![
            Payment {
                id: "pay-1".to_string(),
                account_id: "acc-1".to_string(),
                event_id: "e-1".to_string(),
                payee_id: "p-1".to_string(),
                factor: 1,
                extra: 100,
                created_at: now,
                updated_at: now,
            },
            Payment {
                id: "pay-2".to_string(),
                account_id: "acc-1".to_string(),
                event_id: "e-1".to_string(),
                payee_id: "p-2".to_string(),
                factor: 1,
                extra: 0,
                created_at: now,
                updated_at: now,
            },
        ];
        let draft = SplitDraft::from_event(&event, &payments);
        assert_eq!(draft.entries.len(), 2);
        assert_eq!(draft.portion, dec!(450.00));

        let views = payment_views(&event, payments);
        let totals: Vec<_> = views.iter().map(|v| v.total).collect();
        assert_eq!(totals, vec![dec!(550.00), dec!(450.00)]);
    }
}
