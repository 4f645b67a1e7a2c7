use anyhow::{anyhow, Result};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_traits::ToPrimitive;
use reqwest::StatusCode;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{Product, Variant};

const PRODUCT_INDEX: &str = "products";

/// Stock shown for a product sold without variants; such products are
/// never inventory-tracked.
const UNTRACKED_STOCK: i32 = 999;

/// One searchable document, one per active variant (or one per product
/// when it has none). Upserting the same id with the same content makes
/// the sync handler naturally idempotent.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProductDoc {
    #[serde(skip)]
    pub doc_id: String,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub brand: String,
    pub price: f64,
    pub in_stock: bool,
    pub stock_quantity: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl ProductDoc {
    pub fn for_variant(product: &Product, variant: &Variant) -> Self {
        Self {
            doc_id: format!("v_{}", variant.id),
            product_id: product.id,
            variant_id: Some(variant.id),
            sku: variant.sku.clone(),
            name: product.name.clone(),
            slug: product.slug.clone(),
            description: product.description.clone(),
            brand: product.brand.clone(),
            price: to_f64(&variant.effective_price(&product.base_price)),
            in_stock: variant.stock_quantity > 0,
            stock_quantity: variant.stock_quantity,
            is_active: product.is_active && variant.is_active,
            created_at: product.created_at,
        }
    }

    pub fn for_product(product: &Product) -> Self {
        Self {
            doc_id: format!("p_{}", product.id),
            product_id: product.id,
            variant_id: None,
            sku: format!("PROD-{}", product.id),
            name: product.name.clone(),
            slug: product.slug.clone(),
            description: product.description.clone(),
            brand: product.brand.clone(),
            price: to_f64(&product.base_price),
            in_stock: true,
            stock_quantity: UNTRACKED_STOCK,
            is_active: product.is_active,
            created_at: product.created_at,
        }
    }
}

fn to_f64(value: &BigDecimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

/// Thin client for the document store behind search. Reached by document
/// id only; ranking and analysis are the store's concern.
#[derive(Clone)]
pub struct IndexClient {
    http: reqwest::Client,
    base_url: String,
}

impl IndexClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn upsert(&self, doc: &ProductDoc) -> Result<()> {
        let url = format!("{}/{}/_doc/{}", self.base_url, PRODUCT_INDEX, doc.doc_id);
        let response = self.http.put(&url).json(doc).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "index upsert for {} returned {}",
                doc.doc_id,
                response.status()
            ));
        }
        Ok(())
    }

    /// Removes every document for a product. Deleting documents that were
    /// never indexed is a no-op, so this is safe to replay.
    pub async fn delete_by_product(&self, product_id: Uuid) -> Result<()> {
        let url = format!("{}/{}/_delete_by_query", self.base_url, PRODUCT_INDEX);
        let query = serde_json::json!({
            "query": { "term": { "product_id": product_id } }
        });
        let response = self.http.post(&url).json(&query).send().await?;
        if !delete_status_ok(response.status()) {
            return Err(anyhow!(
                "index delete for product {} returned {}",
                product_id,
                response.status()
            ));
        }
        Ok(())
    }
}

/// A 404 from delete-by-query means the index holds nothing for this
/// product; deleting absent documents is a no-op, not a failure.
fn delete_status_ok(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Product {
        Product {
            id: Uuid::new_v4(),
            name: "Trail Shoe".to_string(),
            slug: "trail-shoe".to_string(),
            description: "A shoe for trails".to_string(),
            brand: "Ridge".to_string(),
            base_price: BigDecimal::from(80),
            has_variants: true,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn variant(product_id: Uuid, price: Option<i64>, stock: i32) -> Variant {
        Variant {
            id: Uuid::new_v4(),
            product_id,
            sku: "SHOE-42".to_string(),
            price: price.map(BigDecimal::from),
            stock_quantity: stock,
            is_active: true,
        }
    }

    #[test]
    fn variant_doc_uses_effective_price() {
        let product = product();

        let priced = variant(product.id, Some(65), 3);
        let doc = ProductDoc::for_variant(&product, &priced);
        assert_eq!(doc.doc_id, format!("v_{}", priced.id));
        assert_eq!(doc.price, 65.0);
        assert!(doc.in_stock);
        assert_eq!(doc.stock_quantity, 3);

        let unpriced = variant(product.id, None, 0);
        let doc = ProductDoc::for_variant(&product, &unpriced);
        assert_eq!(doc.price, 80.0);
        assert!(!doc.in_stock);
    }

    #[test]
    fn variantless_product_doc_shape() {
        let mut product = product();
        product.has_variants = false;

        let doc = ProductDoc::for_product(&product);
        assert_eq!(doc.doc_id, format!("p_{}", product.id));
        assert_eq!(doc.sku, format!("PROD-{}", product.id));
        assert_eq!(doc.variant_id, None);
        assert!(doc.in_stock);
        assert_eq!(doc.stock_quantity, UNTRACKED_STOCK);
    }

    #[test]
    fn inactive_variant_marks_doc_inactive() {
        let product = product();
        let mut v = variant(product.id, Some(65), 1);
        v.is_active = false;
        assert!(!ProductDoc::for_variant(&product, &v).is_active);
    }

    #[test]
    fn deleting_absent_documents_is_a_no_op() {
        assert!(delete_status_ok(StatusCode::NOT_FOUND));
        assert!(delete_status_ok(StatusCode::OK));
        assert!(!delete_status_ok(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!delete_status_ok(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn doc_id_stays_out_of_the_document_body() {
        let product = product();
        let v = variant(product.id, Some(65), 1);
        let body = serde_json::to_value(ProductDoc::for_variant(&product, &v)).unwrap();
        assert!(body.get("doc_id").is_none());
        assert_eq!(body["sku"], "SHOE-42");
    }
}
