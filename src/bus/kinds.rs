//! Message taxonomy
//!
//! The closed set of message kinds the bus carries. Each kind has a marker type
//! implementing [`Message`], which fixes its request and response types so
//! `register::<M>` and `call::<M>` are checked at compile time. Dynamic kinds
//! still go through the raw API.

use crate::bus::codec::Buf;
use crate::bus::error::BusError;
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind the background answers with the sender's own address.
pub const TAB_ID: &str = "_tab_";

/// A message kind with typed request and response payloads.
pub trait Message: Send + Sync + 'static {
    /// Wire name of the kind
    const NAME: &'static str;
    type Request: Serialize + DeserializeOwned + Send + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Every kind the bus knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    TabId,
    GetActiveTabInfo,
    InMemoryStoreGet,
    InMemoryStoreSet,
    PgpKeyBinaryToArmored,
    AjaxGmailAttachmentGetChunk,
    Settings,
    SetCss,
    AddClass,
    RemoveClass,
    CloseDialog,
    PassphraseEntry,
    ConfirmationResult,
    ShowAttachmentPreview,
    Reload,
    Redirect,
    NotificationShow,
}

impl Kind {
    pub const ALL: [Kind; 17] = [
        Kind::TabId,
        Kind::GetActiveTabInfo,
        Kind::InMemoryStoreGet,
        Kind::InMemoryStoreSet,
        Kind::PgpKeyBinaryToArmored,
        Kind::AjaxGmailAttachmentGetChunk,
        Kind::Settings,
        Kind::SetCss,
        Kind::AddClass,
        Kind::RemoveClass,
        Kind::CloseDialog,
        Kind::PassphraseEntry,
        Kind::ConfirmationResult,
        Kind::ShowAttachmentPreview,
        Kind::Reload,
        Kind::Redirect,
        Kind::NotificationShow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::TabId => TabId::NAME,
            Kind::GetActiveTabInfo => GetActiveTabInfo::NAME,
            Kind::InMemoryStoreGet => InMemoryStoreGet::NAME,
            Kind::InMemoryStoreSet => InMemoryStoreSet::NAME,
            Kind::PgpKeyBinaryToArmored => PgpKeyBinaryToArmored::NAME,
            Kind::AjaxGmailAttachmentGetChunk => AjaxGmailAttachmentGetChunk::NAME,
            Kind::Settings => Settings::NAME,
            Kind::SetCss => SetCss::NAME,
            Kind::AddClass => AddClass::NAME,
            Kind::RemoveClass => RemoveClass::NAME,
            Kind::CloseDialog => CloseDialog::NAME,
            Kind::PassphraseEntry => PassphraseEntry::NAME,
            Kind::ConfirmationResult => ConfirmationResult::NAME,
            Kind::ShowAttachmentPreview => ShowAttachmentPreview::NAME,
            Kind::Reload => Reload::NAME,
            Kind::Redirect => Redirect::NAME,
            Kind::NotificationShow => NotificationShow::NAME,
        }
    }

    /// Handled by the background rather than by a page or frame
    pub fn is_background_bound(&self) -> bool {
        matches!(
            self,
            Kind::TabId
                | Kind::GetActiveTabInfo
                | Kind::InMemoryStoreGet
                | Kind::InMemoryStoreSet
                | Kind::PgpKeyBinaryToArmored
                | Kind::AjaxGmailAttachmentGetChunk
                | Kind::Settings
        )
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown message kind '{}'", s))
    }
}

/// Serialize a typed payload into the bus value model.
pub fn to_payload<T: Serialize>(kind: &str, value: &T) -> Result<Value, BusError> {
    Value::serialized(value).map_err(|e| BusError::Payload(format!("{}: cannot encode: {}", kind, e)))
}

/// Deserialize a bus value into a typed payload.
pub fn from_payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, BusError> {
    value
        .deserialized()
        .map_err(|e| BusError::Payload(format!("{}: unexpected payload shape: {}", kind, e)))
}

macro_rules! message {
    ($(#[$meta:meta])* $marker:ident, $name:expr, $req:ty => $res:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $marker;

        impl Message for $marker {
            const NAME: &'static str = $name;
            type Request = $req;
            type Response = $res;
        }
    };
}

/// Request with no fields; travels as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

// Background-bound

message!(
    /// Ask the background for the sender's own address
    TabId, TAB_ID, Empty => TabIdResponse
);
message!(GetActiveTabInfo, "get_active_tab_info", Empty => ActiveTabInfo);
message!(InMemoryStoreGet, "inMemoryStoreGet", StoreGetRequest => Option<String>);
message!(InMemoryStoreSet, "inMemoryStoreSet", StoreSetRequest => ());
message!(PgpKeyBinaryToArmored, "pgpKeyBinaryToArmored", BinaryKeysRequest => ArmoredKeys);
message!(
    /// Fetch one chunk of a mail attachment; the chunk travels as a binary handle
    AjaxGmailAttachmentGetChunk, "ajaxGmailAttachmentGetChunk", AttachmentChunkRequest => AttachmentChunk
);
message!(Settings, "settings", SettingsRequest => ());

// Context-bound

message!(SetCss, "set_css", SetCssRequest => ());
message!(AddClass, "add_class", ClassRequest => ());
message!(RemoveClass, "remove_class", ClassRequest => ());
message!(CloseDialog, "close_dialog", Empty => ());
message!(PassphraseEntry, "passphrase_entry", PassphraseEntryRequest => ());
message!(ConfirmationResult, "confirmation_result", ConfirmationRequest => ());
message!(ShowAttachmentPreview, "show_attachment_preview", AttachmentPreviewRequest => ());
message!(Reload, "reload", ReloadRequest => ());
message!(Redirect, "redirect", RedirectRequest => ());
message!(NotificationShow, "notification_show", NotificationRequest => ());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabIdResponse {
    /// `None` when the sender is not inside a top-level unit
    #[serde(rename = "tabId")]
    pub tab_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTabInfo {
    pub provider: Option<String>,
    pub acct_email: Option<String>,
    pub same_world: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreGetRequest {
    pub acct_email: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSetRequest {
    pub acct_email: String,
    pub key: String,
    pub value: Option<String>,
    /// Unix time in seconds after which the value is gone
    pub expiration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryKeysRequest {
    pub binary_keys_data: Buf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmoredKey {
    pub armored: String,
    pub longid: String,
    #[serde(default)]
    pub emails: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmoredKeys {
    pub keys: Vec<ArmoredKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentChunkRequest {
    pub acct_email: String,
    pub msg_id: String,
    pub attachment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentChunk {
    pub chunk: Buf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acct_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url_params: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_new_acct: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCssRequest {
    pub css: BTreeMap<String, String>,
    /// Apply to the n-th ancestor of each match instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traverse_up: Option<u32>,
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRequest {
    pub class: String,
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassphraseEntryRequest {
    pub entered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_frame_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPreviewRequest {
    pub iframe_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRequest {
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub notification: String,
    pub group: String,
}
