//! Cheapest spot price lookup across regions

use crate::context::AwsContext;
use crate::error::cloud_error;
use anyhow::{Context, Result};
use aws_sdk_ec2::types::InstanceType;
use chrono::{DateTime, Utc};
use converge_core::error::CloudError;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Error codes for regions the account is not allowed to query
const REGION_DENIED_CODES: &[&str] = &["AuthFailure", "UnauthorizedOperation", "OptInRequired"];

pub const DEFAULT_PRODUCT_DESCRIPTION: &str = "Linux/UNIX";

/// Latest spot price in one availability zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotPriceQuote {
    pub instance_type: String,
    pub product_description: String,
    pub region: String,
    pub availability_zone: String,
    pub price: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Query options for [`find_cheapest_prices`].
#[derive(Debug, Clone)]
pub struct SpotPriceQuery {
    pub instance_type: String,
    pub product_description: String,
    /// Only these regions, when set
    pub regions: Option<Vec<String>>,
    /// Drop zones priced above this
    pub max_bid: Option<f64>,
}

impl SpotPriceQuery {
    pub fn new(instance_type: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            product_description: DEFAULT_PRODUCT_DESCRIPTION.to_string(),
            regions: None,
            max_bid: None,
        }
    }
}

/// Keep the newest quote per zone, drop those above `max_bid`, and sort
/// the rest cheapest first.
pub fn select_quotes(quotes: Vec<SpotPriceQuote>, max_bid: Option<f64>) -> Vec<SpotPriceQuote> {
    let mut latest: BTreeMap<(String, String), SpotPriceQuote> = BTreeMap::new();
    for quote in quotes {
        let key = (quote.region.clone(), quote.availability_zone.clone());
        match latest.get(&key) {
            Some(existing) if existing.timestamp >= quote.timestamp => {}
            _ => {
                latest.insert(key, quote);
            }
        }
    }

    let mut selected: Vec<SpotPriceQuote> = latest
        .into_values()
        .filter(|q| max_bid.is_none_or(|bid| q.price <= bid))
        .collect();
    selected.sort_by(|a, b| a.price.total_cmp(&b.price));
    selected
}

fn is_region_denied(err: &CloudError) -> bool {
    err.code().is_some_and(|c| REGION_DENIED_CODES.contains(&c))
}

fn to_chrono(ts: &aws_sdk_ec2::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

/// Find the current spot price for an instance type in every availability
/// zone of every enabled region, cheapest first.
///
/// Regions that reject the credentials are skipped with a warning.
pub async fn find_cheapest_prices(ctx: &AwsContext, query: &SpotPriceQuery) -> Result<Vec<SpotPriceQuote>> {
    let response = ctx
        .ec2_client()
        .describe_regions()
        .send()
        .await
        .map_err(cloud_error)
        .context("Failed to describe regions")?;

    let regions: Vec<String> = response
        .regions()
        .iter()
        .filter_map(|r| r.region_name())
        .filter(|name| {
            query
                .regions
                .as_ref()
                .is_none_or(|wanted| wanted.iter().any(|w| w == name))
        })
        .map(str::to_string)
        .collect();

    info!(
        instance_type = %query.instance_type,
        regions = regions.len(),
        "Querying spot prices"
    );

    let results = join_all(regions.iter().map(|region| region_quotes(ctx, region, query))).await;

    let mut quotes = Vec::new();
    for (region, result) in regions.iter().zip(results) {
        match result {
            Ok(found) => quotes.extend(found),
            Err(e) if is_region_denied(&e) => {
                warn!(region = %region, error = %e, "Not authorized for region, skipping");
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Failed to query spot prices in {region}")));
            }
        }
    }

    Ok(select_quotes(quotes, query.max_bid))
}

async fn region_quotes(
    ctx: &AwsContext,
    region: &str,
    query: &SpotPriceQuery,
) -> std::result::Result<Vec<SpotPriceQuote>, CloudError> {
    let client = ctx.ec2_client_for_region(region);
    let now = aws_sdk_ec2::primitives::DateTime::from_secs(Utc::now().timestamp());
    let mut quotes = Vec::new();
    let mut next_token: Option<String> = None;

    loop {
        let response = client
            .describe_spot_price_history()
            .instance_types(InstanceType::from(query.instance_type.as_str()))
            .product_descriptions(&query.product_description)
            .start_time(now)
            .set_next_token(next_token.take())
            .send()
            .await
            .map_err(cloud_error)?;

        for entry in response.spot_price_history() {
            let (Some(zone), Some(price)) = (entry.availability_zone(), entry.spot_price()) else {
                continue;
            };
            let Ok(price) = price.parse::<f64>() else {
                debug!(zone = %zone, price = %price, "Skipping unparseable spot price");
                continue;
            };
            quotes.push(SpotPriceQuote {
                instance_type: query.instance_type.clone(),
                product_description: query.product_description.clone(),
                region: region.to_string(),
                availability_zone: zone.to_string(),
                price,
                timestamp: entry.timestamp().and_then(to_chrono),
            });
        }

        match response.next_token() {
            Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
            _ => break,
        }
    }

    debug!(region = %region, zones = quotes.len(), "Collected spot prices");
    Ok(quotes)
}
