//! Record types for accounts, categories and transactions.
//!
//! Domain payloads are concretely typed per resource. A [`RecordBody`] is the
//! full field set of one record and a [`RecordPatch`] is a partial update to
//! it; both are tagged by `resource` on the wire.

use crate::{error::Result, DeviceId, Error, RecordId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of record an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Account,
    Category,
    Transaction,
}

impl Resource {
    /// Every resource, in wire order.
    pub const ALL: [Resource; 3] = [Resource::Account, Resource::Category, Resource::Transaction];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Account => "account",
            Resource::Category => "category",
            Resource::Transaction => "transaction",
        }
    }

    /// Parse the lowercase wire name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "account" => Some(Resource::Account),
            "category" => Some(Resource::Category),
            "transaction" => Some(Resource::Transaction),
            _ => None,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying a record across resources.
pub type RecordKey = (Resource, RecordId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Checking,
    Savings,
    Credit,
    Cash,
    Investment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    Income,
    Expense,
}

/// A money account. `balance` is in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub name: String,
    pub kind: AccountKind,
    pub currency: String,
    #[serde(default)]
    pub balance: i64,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AccountKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.kind.is_none()
            && self.currency.is_none()
            && self.balance.is_none()
            && self.archived.is_none()
    }

    fn apply_to(&self, account: &mut Account) {
        if let Some(name) = &self.name {
            account.name = name.clone();
        }
        if let Some(kind) = self.kind {
            account.kind = kind;
        }
        if let Some(currency) = &self.currency {
            account.currency = currency.clone();
        }
        if let Some(balance) = self.balance {
            account.balance = balance;
        }
        if let Some(archived) = self.archived {
            account.archived = archived;
        }
    }

    fn merge(&mut self, later: &AccountPatch) {
        if later.name.is_some() {
            self.name = later.name.clone();
        }
        if later.kind.is_some() {
            self.kind = later.kind;
        }
        if later.currency.is_some() {
            self.currency = later.currency.clone();
        }
        if later.balance.is_some() {
            self.balance = later.balance;
        }
        if later.archived.is_some() {
            self.archived = later.archived;
        }
    }
}

/// An income or expense category, optionally nested under a parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub name: String,
    pub kind: CategoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RecordId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CategoryKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RecordId>,
}

impl CategoryPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.kind.is_none() && self.color.is_none() && self.parent_id.is_none()
    }

    fn apply_to(&self, category: &mut Category) {
        if let Some(name) = &self.name {
            category.name = name.clone();
        }
        if let Some(kind) = self.kind {
            category.kind = kind;
        }
        if self.color.is_some() {
            category.color = self.color.clone();
        }
        if self.parent_id.is_some() {
            category.parent_id = self.parent_id.clone();
        }
    }

    fn merge(&mut self, later: &CategoryPatch) {
        if later.name.is_some() {
            self.name = later.name.clone();
        }
        if later.kind.is_some() {
            self.kind = later.kind;
        }
        if later.color.is_some() {
            self.color = later.color.clone();
        }
        if later.parent_id.is_some() {
            self.parent_id = later.parent_id.clone();
        }
    }
}

/// A ledger entry against an account. Negative `amount` is an outflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub account_id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<RecordId>,
    pub amount: i64,
    #[serde(default)]
    pub description: String,
    pub occurred_at: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<Timestamp>,
}

impl TransactionPatch {
    pub fn is_empty(&self) -> bool {
        self.account_id.is_none()
            && self.category_id.is_none()
            && self.amount.is_none()
            && self.description.is_none()
            && self.occurred_at.is_none()
    }

    fn apply_to(&self, transaction: &mut Transaction) {
        if let Some(account_id) = &self.account_id {
            transaction.account_id = account_id.clone();
        }
        if self.category_id.is_some() {
            transaction.category_id = self.category_id.clone();
        }
        if let Some(amount) = self.amount {
            transaction.amount = amount;
        }
        if let Some(description) = &self.description {
            transaction.description = description.clone();
        }
        if let Some(occurred_at) = self.occurred_at {
            transaction.occurred_at = occurred_at;
        }
    }

    fn merge(&mut self, later: &TransactionPatch) {
        if later.account_id.is_some() {
            self.account_id = later.account_id.clone();
        }
        if later.category_id.is_some() {
            self.category_id = later.category_id.clone();
        }
        if later.amount.is_some() {
            self.amount = later.amount;
        }
        if later.description.is_some() {
            self.description = later.description.clone();
        }
        if later.occurred_at.is_some() {
            self.occurred_at = later.occurred_at;
        }
    }
}

/// Full field set of a record, tagged by resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "lowercase")]
pub enum RecordBody {
    Account(Account),
    Category(Category),
    Transaction(Transaction),
}

impl RecordBody {
    pub fn resource(&self) -> Resource {
        match self {
            RecordBody::Account(_) => Resource::Account,
            RecordBody::Category(_) => Resource::Category,
            RecordBody::Transaction(_) => Resource::Transaction,
        }
    }

    /// Apply a patch of the same resource in place.
    pub fn apply(&mut self, patch: &RecordPatch) -> Result<()> {
        match (self, patch) {
            (RecordBody::Account(body), RecordPatch::Account(p)) => p.apply_to(body),
            (RecordBody::Category(body), RecordPatch::Category(p)) => p.apply_to(body),
            (RecordBody::Transaction(body), RecordPatch::Transaction(p)) => p.apply_to(body),
            (body, patch) => {
                return Err(Error::ResourceMismatch {
                    expected: body.resource(),
                    actual: patch.resource(),
                })
            }
        }
        Ok(())
    }

    /// Build a body from a resource and its untagged field object.
    pub fn from_fields(resource: Resource, fields: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(mut map) = fields else {
            return Err(Error::validation(format!("{resource} fields must be an object")));
        };
        map.insert("resource".into(), resource.as_str().into());
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| Error::validation(format!("invalid {resource} fields: {e}")))
    }

    /// The untagged field object (no `resource` key).
    pub fn to_fields(&self) -> serde_json::Value {
        untagged(serde_json::to_value(self))
    }
}

/// Partial update of a record, tagged by resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "lowercase")]
pub enum RecordPatch {
    Account(AccountPatch),
    Category(CategoryPatch),
    Transaction(TransactionPatch),
}

impl RecordPatch {
    pub fn resource(&self) -> Resource {
        match self {
            RecordPatch::Account(_) => Resource::Account,
            RecordPatch::Category(_) => Resource::Category,
            RecordPatch::Transaction(_) => Resource::Transaction,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RecordPatch::Account(p) => p.is_empty(),
            RecordPatch::Category(p) => p.is_empty(),
            RecordPatch::Transaction(p) => p.is_empty(),
        }
    }

    /// Fold a later patch into this one; fields set by `later` win.
    pub fn merge(&mut self, later: &RecordPatch) -> Result<()> {
        match (self, later) {
            (RecordPatch::Account(p), RecordPatch::Account(l)) => p.merge(l),
            (RecordPatch::Category(p), RecordPatch::Category(l)) => p.merge(l),
            (RecordPatch::Transaction(p), RecordPatch::Transaction(l)) => p.merge(l),
            (patch, later) => {
                return Err(Error::ResourceMismatch {
                    expected: patch.resource(),
                    actual: later.resource(),
                })
            }
        }
        Ok(())
    }

    /// Build a patch from a resource and its untagged field object.
    pub fn from_fields(resource: Resource, fields: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(mut map) = fields else {
            return Err(Error::validation(format!("{resource} patch must be an object")));
        };
        map.insert("resource".into(), resource.as_str().into());
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| Error::validation(format!("invalid {resource} patch: {e}")))
    }

    /// The untagged field object; unset fields are omitted.
    pub fn to_fields(&self) -> serde_json::Value {
        untagged(serde_json::to_value(self))
    }
}

fn untagged(value: serde_json::Result<serde_json::Value>) -> serde_json::Value {
    match value {
        Ok(serde_json::Value::Object(mut map)) => {
            map.remove("resource");
            serde_json::Value::Object(map)
        }
        _ => serde_json::Value::Object(Default::default()),
    }
}

/// A versioned record as held by the Record Store.
///
/// `sync_version` starts at 1 on creation and is advanced by exactly one for
/// every accepted mutation. Only the Record Store advances it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Client-chosen identifier
    pub id: RecordId,
    /// Domain fields, tagged by resource
    #[serde(flatten)]
    pub body: RecordBody,
    /// Optimistic-lock version
    pub sync_version: Version,
    /// Soft delete flag (tombstone)
    #[serde(default)]
    pub is_deleted: bool,
    /// Device whose mutation produced this version
    pub last_modified_by: DeviceId,
    /// Server time of creation (milliseconds since epoch)
    #[serde(default)]
    pub created_at: Timestamp,
    /// Server time of the last accepted mutation
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl Record {
    /// Create a record at version 1.
    pub fn new(
        id: impl Into<RecordId>,
        body: RecordBody,
        device_id: impl Into<DeviceId>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            body,
            sync_version: 1,
            is_deleted: false,
            last_modified_by: device_id.into(),
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn resource(&self) -> Resource {
        self.body.resource()
    }

    pub fn key(&self) -> RecordKey {
        (self.resource(), self.id.clone())
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }

    /// Record an accepted mutation: bump the version and stamp the author.
    pub fn advance(&mut self, device_id: &str, timestamp: Timestamp) {
        self.sync_version += 1;
        self.last_modified_by = device_id.to_string();
        self.updated_at = timestamp;
    }
}
