use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{BillingError, BillingResult};
use crate::store::CurrencyStore;

use super::models::{Currency, ExchangeQuote, ExchangeRate, Rounding};

/// key: billing-currency-graph -> exchange resolution across currencies
#[derive(Clone)]
pub struct CurrencyGraph {
    store: Arc<dyn CurrencyStore>,
}

impl CurrencyGraph {
    pub fn new(store: Arc<dyn CurrencyStore>) -> Self {
        Self { store }
    }

    /// Resolves the compound rate along the path with the fewest edges.
    ///
    /// Each hop multiplies the rate by `rate * (1 + commission / 100)` and
    /// commissions add up along the path. Same-currency lookups never touch the store.
    pub async fn get_exchange_rate(&self, from: i32, to: i32) -> BillingResult<ExchangeQuote> {
        if from == to {
            return Ok(ExchangeQuote::IDENTITY);
        }

        let edges = self.store.list_rates().await?;
        let path = shortest_path(&edges, from, to).ok_or_else(|| {
            BillingError::not_found(format!("no exchange path from {from} to {to}"))
        })?;

        let quote = path.iter().fold(ExchangeQuote::IDENTITY, |acc, edge| ExchangeQuote {
            rate: acc.rate * (edge.rate + edge.rate * edge.commission / 100.0),
            commission: acc.commission + edge.commission,
        });
        debug!(from, to, hops = path.len(), rate = quote.rate, "resolved exchange rate");
        Ok(quote)
    }

    pub async fn get_direct_rate(&self, from: i32, to: i32) -> BillingResult<ExchangeRate> {
        self.store
            .get_rate(from, to)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("no direct rate from {from} to {to}")))
    }

    pub async fn convert(&self, from: i32, to: i32, amount: f64) -> BillingResult<f64> {
        let quote = self.get_exchange_rate(from, to).await?;
        Ok(amount * quote.rate)
    }

    /// Converts and rounds with the target currency's own precision and mode.
    pub async fn convert_rounded(&self, from: i32, to: i32, amount: f64) -> BillingResult<f64> {
        let converted = self.convert(from, to, amount).await?;
        let (precision, rounding) = match self.store.get_currency(to).await? {
            Some(currency) => (currency.precision, currency.rounding),
            None => (2, Rounding::Round),
        };
        Ok(rounding.apply(converted, precision))
    }

    pub async fn create_rate(&self, rate: ExchangeRate) -> BillingResult<ExchangeRate> {
        validate_rate(&rate)?;
        self.store.upsert_rate(&rate).await?;
        info!(from = rate.from, to = rate.to, rate = rate.rate, "exchange rate stored");
        Ok(rate)
    }

    pub async fn update_rate(&self, rate: ExchangeRate) -> BillingResult<ExchangeRate> {
        validate_rate(&rate)?;
        if !self.store.update_rate(&rate).await? {
            return Err(BillingError::not_found(format!(
                "exchange rate {}-{} not found",
                rate.from, rate.to
            )));
        }
        info!(from = rate.from, to = rate.to, rate = rate.rate, "exchange rate updated");
        Ok(rate)
    }

    pub async fn delete_rate(&self, from: i32, to: i32) -> BillingResult<()> {
        if !self.store.delete_rate(from, to).await? {
            return Err(BillingError::not_found(format!(
                "exchange rate {from}-{to} not found"
            )));
        }
        info!(from, to, "exchange rate deleted");
        Ok(())
    }

    pub async fn list_rates(&self) -> BillingResult<Vec<ExchangeRate>> {
        Ok(self.store.list_rates().await?)
    }

    pub async fn get_currency(&self, id: i32) -> BillingResult<Option<Currency>> {
        Ok(self.store.get_currency(id).await?)
    }

    pub async fn create_currency(&self, currency: Currency) -> BillingResult<Currency> {
        if currency.title.trim().is_empty() {
            return Err(BillingError::invalid("currency title must not be empty"));
        }
        if self.store.get_currency(currency.id).await?.is_some() {
            return Err(BillingError::invalid(format!(
                "currency {} already exists",
                currency.id
            )));
        }
        self.store.upsert_currency(&currency).await?;
        Ok(currency)
    }

    pub async fn update_currency(&self, currency: Currency) -> BillingResult<Currency> {
        if self.store.get_currency(currency.id).await?.is_none() {
            return Err(BillingError::not_found(format!(
                "currency {} not found",
                currency.id
            )));
        }
        self.store.upsert_currency(&currency).await?;
        Ok(currency)
    }

    /// Non-public currencies are only listed for admins asking for them.
    pub async fn list_currencies(&self, include_private: bool) -> BillingResult<Vec<Currency>> {
        let currencies = self.store.list_currencies().await?;
        Ok(currencies
            .into_iter()
            .filter(|currency| include_private || currency.public)
            .collect())
    }
}

fn validate_rate(rate: &ExchangeRate) -> BillingResult<()> {
    if rate.from == rate.to {
        return Err(BillingError::invalid("exchange rate must join two currencies"));
    }
    if !(rate.rate > 0.0) {
        return Err(BillingError::invalid("exchange rate must be positive"));
    }
    if rate.commission < 0.0 {
        return Err(BillingError::invalid("commission must not be negative"));
    }
    Ok(())
}

/// Breadth-first search returning the edges of a fewest-hop path.
fn shortest_path(edges: &[ExchangeRate], from: i32, to: i32) -> Option<Vec<ExchangeRate>> {
    let mut adjacency: HashMap<i32, Vec<&ExchangeRate>> = HashMap::new();
    for edge in edges {
        adjacency.entry(edge.from).or_default().push(edge);
    }

    let mut visited = HashSet::from([from]);
    let mut previous: HashMap<i32, &ExchangeRate> = HashMap::new();
    let mut queue = VecDeque::from([from]);

    while let Some(vertex) = queue.pop_front() {
        if vertex == to {
            let mut path = Vec::new();
            let mut cursor = to;
            while let Some(edge) = previous.get(&cursor) {
                path.push((*edge).clone());
                cursor = edge.from;
            }
            path.reverse();
            return Some(path);
        }
        for edge in adjacency.get(&vertex).into_iter().flatten() {
            if visited.insert(edge.to) {
                previous.insert(edge.to, edge);
                queue.push_back(edge.to);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn edge(from: i32, to: i32, rate: f64, commission: f64) -> ExchangeRate {
        ExchangeRate {
            from,
            to,
            rate,
            commission,
        }
    }

    #[test]
    fn shortest_path_prefers_fewest_hops() {
        let edges = vec![
            edge(1, 2, 2.0, 0.0),
            edge(2, 3, 2.0, 0.0),
            edge(3, 4, 2.0, 0.0),
            edge(1, 4, 5.0, 0.0),
        ];
        let path = shortest_path(&edges, 1, 4).expect("path");
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].rate, 5.0);
    }

    #[test]
    fn shortest_path_respects_direction() {
        let edges = vec![edge(1, 2, 2.0, 0.0)];
        assert!(shortest_path(&edges, 2, 1).is_none());
    }

    #[test]
    fn rejects_non_positive_rates() {
        assert!(validate_rate(&edge(1, 2, 0.0, 0.0)).is_err());
        assert!(validate_rate(&edge(1, 2, -1.0, 0.0)).is_err());
        assert!(validate_rate(&edge(1, 2, f64::NAN, 0.0)).is_err());
        assert!(validate_rate(&edge(1, 2, 1.5, 3.0)).is_ok());
    }

    async fn graph_with(edges: &[ExchangeRate]) -> (CurrencyGraph, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for rate in edges {
            store.upsert_rate(rate).await.unwrap();
        }
        (CurrencyGraph::new(store.clone()), store)
    }

    #[tokio::test]
    async fn commissions_compound_along_the_path() {
        let (graph, _) = graph_with(&[edge(1, 2, 2.0, 10.0), edge(2, 3, 3.0, 5.0)]).await;
        let quote = graph.get_exchange_rate(1, 3).await.unwrap();
        assert!((quote.rate - 2.0 * 1.1 * 3.0 * 1.05).abs() < 1e-9);
        assert!((quote.commission - 15.0).abs() < 1e-9);

        let converted = graph.convert(1, 3, 10.0).await.unwrap();
        assert!((converted - 69.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rounded_conversion_uses_target_precision() {
        let (graph, store) = graph_with(&[edge(1, 2, 2.0, 10.0), edge(2, 3, 3.0, 5.0)]).await;
        let mut target = Currency::new(3, "EUR");
        target.precision = 1;
        target.rounding = Rounding::Ceil;
        store.upsert_currency(&target).await.unwrap();

        assert_eq!(graph.convert_rounded(1, 3, 1.0).await.unwrap(), 7.0);
        // Unknown targets fall back to two places, half away from zero.
        assert_eq!(graph.convert_rounded(1, 2, 1.0).await.unwrap(), 2.2);
    }
}
