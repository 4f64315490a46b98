//! Application events accepted by `POST /notifications/trigger`.
//!
//! Each kind knows its audience and how it is worded. Case-related events
//! render as cards on LINE; stock and purchasing events as plain text.

use crate::db::directory::Role;
use crate::line::{ACCENT_INFO, ACCENT_SUCCESS, ACCENT_URGENT};
use crate::notification::{NotificationEvent, Targeting};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct CaseAssigned {
    pub case_id: Uuid,
    pub dentist_id: Uuid,
    pub patient_name: String,
    pub surgery_date: NaiveDate,
    #[serde(default)]
    pub surgery_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaseUpdated {
    pub case_id: Uuid,
    pub dentist_id: Uuid,
    pub patient_name: String,
    pub change: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UrgentCase {
    pub case_id: Uuid,
    pub patient_name: String,
    pub surgery_date: NaiveDate,
    #[serde(default)]
    pub dentist_id: Option<Uuid>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaterialsReady {
    pub case_id: Uuid,
    pub dentist_id: Uuid,
    pub patient_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutOfStock {
    pub product_name: String,
    #[serde(default)]
    pub product_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LowStock {
    pub product_name: String,
    #[serde(default)]
    pub product_code: Option<String>,
    pub quantity: i64,
    pub threshold: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseOrderCreated {
    pub po_number: String,
    pub supplier: String,
    #[serde(default)]
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseOrderApproved {
    pub po_number: String,
    pub supplier: String,
    #[serde(default)]
    pub requested_by: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Custom {
    #[serde(flatten)]
    pub targeting: Targeting,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventRequest {
    CaseAssigned(CaseAssigned),
    CaseUpdated(CaseUpdated),
    UrgentCase(UrgentCase),
    MaterialsReady(MaterialsReady),
    OutOfStock(OutOfStock),
    LowStock(LowStock),
    PurchaseOrderCreated(PurchaseOrderCreated),
    PurchaseOrderApproved(PurchaseOrderApproved),
    Custom(Custom),
}

fn product_label(name: &str, code: Option<&str>) -> String {
    match code {
        Some(code) => format!("{name} ({code})"),
        None => name.to_string(),
    }
}

fn date(d: NaiveDate) -> String {
    d.format("%d/%m/%Y").to_string()
}

impl EventRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            EventRequest::CaseAssigned(_) => "case_assigned",
            EventRequest::CaseUpdated(_) => "case_updated",
            EventRequest::UrgentCase(_) => "urgent_case",
            EventRequest::MaterialsReady(_) => "materials_ready",
            EventRequest::OutOfStock(_) => "out_of_stock",
            EventRequest::LowStock(_) => "low_stock",
            EventRequest::PurchaseOrderCreated(_) => "purchase_order_created",
            EventRequest::PurchaseOrderApproved(_) => "purchase_order_approved",
            EventRequest::Custom(_) => "custom",
        }
    }

    /// The notification and its audience.
    pub fn into_notification(self) -> (NotificationEvent, Targeting) {
        let kind = self.kind();
        match self {
            EventRequest::CaseAssigned(e) => {
                let when = match &e.surgery_time {
                    Some(time) => format!("{} {time}", date(e.surgery_date)),
                    None => date(e.surgery_date),
                };
                let event = NotificationEvent::new(
                    kind,
                    "New case assigned".into(),
                    format!("You have been assigned a case for {} on {when}", e.patient_name),
                    format!("/cases/{}", e.case_id),
                    format!("case-{}", e.case_id),
                )
                .as_card(
                    ACCENT_INFO,
                    vec![
                        ("Patient".into(), e.patient_name.clone()),
                        ("Date".into(), when),
                    ],
                )
                .with_data(serde_json::json!({ "case_id": e.case_id }));
                (event, Targeting::user(e.dentist_id))
            }
            EventRequest::CaseUpdated(e) => {
                let event = NotificationEvent::new(
                    kind,
                    "Case updated".into(),
                    format!("Case for {}: {}", e.patient_name, e.change),
                    format!("/cases/{}", e.case_id),
                    format!("case-{}", e.case_id),
                )
                .as_card(
                    ACCENT_INFO,
                    vec![
                        ("Patient".into(), e.patient_name.clone()),
                        ("Change".into(), e.change.clone()),
                    ],
                )
                .with_data(serde_json::json!({ "case_id": e.case_id }));
                (event, Targeting::user(e.dentist_id))
            }
            EventRequest::UrgentCase(e) => {
                let mut fields = vec![
                    ("Patient".into(), e.patient_name.clone()),
                    ("Date".into(), date(e.surgery_date)),
                ];
                if let Some(reason) = &e.reason {
                    fields.push(("Reason".into(), reason.clone()));
                }
                let event = NotificationEvent::new(
                    kind,
                    "Urgent case".into(),
                    format!(
                        "Urgent case for {} on {} needs attention",
                        e.patient_name,
                        date(e.surgery_date)
                    ),
                    format!("/cases/{}", e.case_id),
                    format!("urgent-{}", e.case_id),
                )
                .as_card(ACCENT_URGENT, fields)
                .with_data(serde_json::json!({ "case_id": e.case_id, "urgent": true }));
                let targeting = Targeting::roles(&[Role::StockStaff, Role::CustomerService])
                    .and_user(e.dentist_id);
                (event, targeting)
            }
            EventRequest::MaterialsReady(e) => {
                let event = NotificationEvent::new(
                    kind,
                    "Materials ready".into(),
                    format!("All materials for {} are ready", e.patient_name),
                    format!("/cases/{}", e.case_id),
                    format!("case-{}", e.case_id),
                )
                .as_card(
                    ACCENT_SUCCESS,
                    vec![("Patient".into(), e.patient_name.clone())],
                )
                .with_data(serde_json::json!({ "case_id": e.case_id }));
                (event, Targeting::user(e.dentist_id))
            }
            EventRequest::OutOfStock(e) => {
                let product = product_label(&e.product_name, e.product_code.as_deref());
                let event = NotificationEvent::new(
                    kind,
                    "Out of stock".into(),
                    format!("{product} is out of stock"),
                    "/inventory".into(),
                    format!("stock-{}", e.product_code.as_deref().unwrap_or(&e.product_name)),
                );
                (event, Targeting::roles(&[Role::StockStaff, Role::Admin]))
            }
            EventRequest::LowStock(e) => {
                let product = product_label(&e.product_name, e.product_code.as_deref());
                let event = NotificationEvent::new(
                    kind,
                    "Low stock".into(),
                    format!(
                        "{product} is running low: {} left (threshold {})",
                        e.quantity, e.threshold
                    ),
                    "/inventory".into(),
                    format!("stock-{}", e.product_code.as_deref().unwrap_or(&e.product_name)),
                )
                .with_data(serde_json::json!({ "quantity": e.quantity, "threshold": e.threshold }));
                (event, Targeting::roles(&[Role::StockStaff]))
            }
            EventRequest::PurchaseOrderCreated(e) => {
                let body = match e.total {
                    Some(total) => format!(
                        "Purchase order {} from {} ({total:.2}) awaits approval",
                        e.po_number, e.supplier
                    ),
                    None => format!(
                        "Purchase order {} from {} awaits approval",
                        e.po_number, e.supplier
                    ),
                };
                let event = NotificationEvent::new(
                    kind,
                    "New purchase order".into(),
                    body,
                    "/purchase-orders".into(),
                    format!("po-{}", e.po_number),
                );
                (event, Targeting::roles(&[Role::Admin]))
            }
            EventRequest::PurchaseOrderApproved(e) => {
                let event = NotificationEvent::new(
                    kind,
                    "Purchase order approved".into(),
                    format!("Purchase order {} from {} was approved", e.po_number, e.supplier),
                    "/purchase-orders".into(),
                    format!("po-{}", e.po_number),
                );
                let targeting = Targeting::roles(&[Role::StockStaff]).and_user(e.requested_by);
                (event, targeting)
            }
            EventRequest::Custom(e) => {
                let event = NotificationEvent::new(
                    kind,
                    e.title,
                    e.body,
                    e.url.unwrap_or_else(|| "/".into()),
                    e.tag.unwrap_or_else(|| "custom".into()),
                );
                (event, e.targeting)
            }
        }
    }
}
