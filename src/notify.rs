//! Recipient notifications for rendered tree cards
//!
//! One mail per recipient/assignee pair listing every tree the pair holds.
//! Quotas already notified, without an address, or with a placeholder
//! address are skipped.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::concurrency::run_with_concurrency;
use crate::db::TreeStore;
use crate::error::{FulfillmentError, Result};
use crate::models::{event_types, RecipientQuota, RequestKind};
use crate::retry::{Exhausted, Retried, RetryPolicy};
use crate::services::events::{EventBus, FulfillmentEvent};

pub const SINGLE_TREE_TEMPLATE: &str = "receiver-single-tree";
pub const MULTI_TREE_TEMPLATE: &str = "receiver-multi-trees";

/// Addresses in this domain belong to placeholder accounts
pub const PLACEHOLDER_EMAIL_SUFFIX: &str = "@14trees";

/// Groups sent per run in test mode
pub const TEST_MODE_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeSummary {
    pub sapling_id: String,
    pub plant_type: String,
    pub card_image_url: Option<String>,
}

/// Template data of one notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationData {
    pub recipient_name: String,
    pub assignee_name: String,
    pub event_name: Option<String>,
    pub relation: Option<String>,
    /// Recipient and assignee are the same person
    pub is_self: bool,
    pub memorial: bool,
    pub is_gift: bool,
    pub count: usize,
    pub trees: Vec<TreeSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub template: String,
    pub data: NotificationData,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a mail. `Ok(Some(message))` means the provider rejected it.
    async fn send(&self, mail: &OutgoingMail) -> Result<Option<String>>;
}

/// Notifier that only writes mails to the log
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, mail: &OutgoingMail) -> Result<Option<String>> {
        info!(
            template = %mail.template,
            to = ?mail.to,
            cc = mail.cc.len(),
            trees = mail.data.count,
            attachments = mail.attachments.len(),
            "Notification"
        );
        Ok(None)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationOptions {
    pub attach_cards: bool,
    pub cc: Vec<String>,
    /// When set, mails go to these addresses instead and are not marked sent
    pub test_recipients: Vec<String>,
}

impl NotificationOptions {
    pub fn is_test(&self) -> bool {
        !self.test_recipients.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationReport {
    pub groups: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

fn is_placeholder(email: &str) -> bool {
    email.trim().ends_with(PLACEHOLDER_EMAIL_SUFFIX)
}

fn attachment_name(assignee_name: &str, url: &str) -> String {
    let file = url.rsplit('/').next().unwrap_or(url);
    format!("{}_{}", assignee_name, file)
}

/// Mails of one recipient/assignee pair
struct MailGroup {
    quota_ids: Vec<i64>,
    mail: OutgoingMail,
}

pub struct NotificationService {
    store: Arc<dyn TreeStore>,
    notifier: Arc<dyn Notifier>,
    events: Arc<EventBus>,
    concurrency: usize,
    retry: RetryPolicy,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn TreeStore>,
        notifier: Arc<dyn Notifier>,
        events: Arc<EventBus>,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            notifier,
            events,
            concurrency,
            retry,
        }
    }

    /// Notify each recipient about their trees.
    pub async fn send_recipient_notifications(
        &self,
        request_id: i64,
        options: &NotificationOptions,
    ) -> Result<NotificationReport> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| FulfillmentError::NotFound(format!("request {}", request_id)))?;
        let quotas = self.store.read_quotas(request_id).await?;
        let units = self.store.list_request_units(request_id).await?;
        let images: HashMap<i64, String> = self
            .store
            .list_cards(request_id)
            .await?
            .into_iter()
            .filter_map(|card| card.image_url.map(|url| (card.unit_id, url)))
            .collect();

        let mut report = NotificationReport::default();
        let mut groups: BTreeMap<(i64, i64), MailGroup> = BTreeMap::new();

        for quota in &quotas {
            let Some(email) = self.deliverable_address(quota) else {
                report.skipped += 1;
                continue;
            };

            let trees: Vec<TreeSummary> = units
                .iter()
                .filter(|unit| quota.owns(unit))
                .map(|unit| TreeSummary {
                    sapling_id: unit.sapling_id.clone(),
                    plant_type: unit.plant_type.clone(),
                    card_image_url: images.get(&unit.id).cloned(),
                })
                .collect();
            if trees.is_empty() {
                report.skipped += 1;
                continue;
            }

            let group = groups.entry((quota.recipient, quota.assignee)).or_insert_with(|| MailGroup {
                quota_ids: Vec::new(),
                mail: OutgoingMail {
                    template: String::new(),
                    data: NotificationData {
                        recipient_name: quota.recipient_name.clone(),
                        assignee_name: quota.assignee_name.clone(),
                        event_name: request.event_name.clone(),
                        relation: quota.relation.clone(),
                        is_self: quota.recipient == quota.assignee,
                        memorial: request.event_type.as_deref() == Some(event_types::MEMORIAL),
                        is_gift: request.kind == RequestKind::Gift,
                        count: 0,
                        trees: Vec::new(),
                    },
                    to: if options.is_test() {
                        options.test_recipients.clone()
                    } else {
                        vec![email.to_string()]
                    },
                    cc: options.cc.clone(),
                    attachments: Vec::new(),
                },
            });
            group.quota_ids.push(quota.id);
            group.mail.data.trees.extend(trees);
        }

        let mut ready: Vec<MailGroup> = groups.into_values().collect();
        if options.is_test() {
            ready.truncate(TEST_MODE_LIMIT);
        }
        for group in &mut ready {
            let data = &mut group.mail.data;
            data.count = data.trees.len();
            group.mail.template = if data.count > 1 {
                MULTI_TREE_TEMPLATE.to_string()
            } else {
                SINGLE_TREE_TEMPLATE.to_string()
            };
            if options.attach_cards {
                group.mail.attachments = data
                    .trees
                    .iter()
                    .filter_map(|tree| tree.card_image_url.as_ref())
                    .map(|url| Attachment {
                        filename: attachment_name(&data.assignee_name, url),
                        url: url.clone(),
                    })
                    .collect();
            }
        }
        report.groups = ready.len();
        debug!(request_id = request_id, groups = ready.len(), test = options.is_test(), "Prepared notifications");

        let test_mode = options.is_test();
        let tasks: Vec<_> = ready
            .into_iter()
            .map(|group| {
                let notifier = self.notifier.clone();
                let store = self.store.clone();
                let retry = self.retry;
                move || async move {
                    let outcome = retry
                        .run(|_| {
                            let notifier = notifier.clone();
                            let mail = group.mail.clone();
                            async move { notifier.send(&mail).await }
                        })
                        .await;
                    let error = match outcome {
                        Ok(Retried { value: None, .. }) => None,
                        Ok(Retried { value: Some(rejected), .. }) => Some(rejected),
                        Err(Exhausted { error, .. }) => Some(error.to_string()),
                    };
                    for quota_id in &group.quota_ids {
                        store
                            .update_quota_mail(*quota_id, error.is_none() && !test_mode, error.clone())
                            .await?;
                    }
                    Ok((group.quota_ids, error))
                }
            })
            .collect();

        for (quota_ids, error) in run_with_concurrency(tasks, self.concurrency).await? {
            match error {
                None => report.sent += 1,
                Some(ref e) => {
                    warn!(request_id = request_id, quotas = ?quota_ids, error = %e, "Notification failed");
                    report.failed += 1;
                }
            }
            for quota_id in quota_ids {
                self.events.emit(FulfillmentEvent::NotificationSent {
                    request_id,
                    quota_id,
                    error: error.clone(),
                });
            }
        }

        info!(
            request_id = request_id,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "Recipient notifications finished"
        );
        Ok(report)
    }

    fn deliverable_address<'a>(&self, quota: &'a RecipientQuota) -> Option<&'a str> {
        if quota.mail_sent {
            return None;
        }
        quota
            .recipient_email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty() && !is_placeholder(email))
    }
}
