//! Explicit symbol registry
//!
//! Every tradable symbol maps to a configured `(base, quote)` asset pair.
//! Decomposition is always a registry lookup - never inferred from the
//! symbol text, since quote assets are not fixed-length.

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use crate::core_types::{AssetId, SymbolId};
use crate::fee::{DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE};
use crate::money::{self, MoneyError};

/// Asset definition
#[derive(Debug, Clone)]
pub struct AssetInfo {
    pub asset_id: AssetId,
    pub name: String,
    /// Internal storage scale (e.g. 8 for BTC = satoshi).
    /// WARNING: never change after initial setup.
    pub scale: u32,
}

/// Symbol (trading pair) definition
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol_id: SymbolId,
    pub symbol: String,
    pub base_asset_id: AssetId,
    pub quote_asset_id: AssetId,
    /// Base asset scale, cached for the hot path.
    pub base_scale: u32,
    /// Quote asset scale; prices are stored at this scale.
    pub quote_scale: u32,
    /// Maker fee rate (10^6 precision: 1000 = 0.10%)
    pub maker_fee_rate: u64,
    /// Taker fee rate (10^6 precision)
    pub taker_fee_rate: u64,
}

impl SymbolInfo {
    /// Parse a client quantity into scaled base units.
    pub fn parse_qty(&self, qty: Decimal) -> Result<u64, MoneyError> {
        money::parse_decimal(qty, self.base_scale)
    }

    /// Parse a client price into scaled quote units.
    pub fn parse_price(&self, price: Decimal) -> Result<u64, MoneyError> {
        money::parse_decimal(price, self.quote_scale)
    }

    pub fn qty_to_decimal(&self, qty: u64) -> Decimal {
        money::to_decimal(qty, self.base_scale)
    }

    pub fn price_to_decimal(&self, price: u64) -> Decimal {
        money::to_decimal(price, self.quote_scale)
    }

    /// Quote amount for `qty` at `price` in scaled quote units.
    pub fn quote_amount(&self, price: u64, qty: u64) -> Result<u64, MoneyError> {
        money::quote_amount(price, qty, self.base_scale)
    }
}

/// Manages symbol and asset lookups in both directions.
#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    symbol_to_id: FxHashMap<String, SymbolId>,
    symbols: FxHashMap<SymbolId, SymbolInfo>,
    asset_to_id: FxHashMap<String, AssetId>,
    assets: FxHashMap<AssetId, AssetInfo>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_asset(
        &mut self,
        asset_id: AssetId,
        name: &str,
        scale: u32,
    ) -> Result<(), &'static str> {
        if scale > money::MAX_SCALE {
            return Err("asset scale exceeds maximum fractional digits");
        }
        if self.assets.contains_key(&asset_id) {
            return Err("duplicate asset_id");
        }
        if self.asset_to_id.contains_key(name) {
            return Err("duplicate asset name");
        }
        self.asset_to_id.insert(name.to_string(), asset_id);
        self.assets.insert(
            asset_id,
            AssetInfo {
                asset_id,
                name: name.to_string(),
                scale,
            },
        );
        Ok(())
    }

    pub fn add_symbol(
        &mut self,
        symbol_id: SymbolId,
        symbol: &str,
        base_asset_id: AssetId,
        quote_asset_id: AssetId,
    ) -> Result<(), &'static str> {
        self.add_symbol_with_fees(
            symbol_id,
            symbol,
            base_asset_id,
            quote_asset_id,
            DEFAULT_MAKER_FEE,
            DEFAULT_TAKER_FEE,
        )
    }

    pub fn add_symbol_with_fees(
        &mut self,
        symbol_id: SymbolId,
        symbol: &str,
        base_asset_id: AssetId,
        quote_asset_id: AssetId,
        maker_fee_rate: u64,
        taker_fee_rate: u64,
    ) -> Result<(), &'static str> {
        let base_scale = self
            .assets
            .get(&base_asset_id)
            .map(|a| a.scale)
            .ok_or("base_asset_id not found in assets")?;
        let quote_scale = self
            .assets
            .get(&quote_asset_id)
            .map(|a| a.scale)
            .ok_or("quote_asset_id not found in assets")?;
        if base_asset_id == quote_asset_id {
            return Err("base and quote assets must differ");
        }
        if self.symbols.contains_key(&symbol_id) {
            return Err("duplicate symbol_id");
        }
        if self.symbol_to_id.contains_key(symbol) {
            return Err("duplicate symbol");
        }

        self.symbol_to_id.insert(symbol.to_string(), symbol_id);
        self.symbols.insert(
            symbol_id,
            SymbolInfo {
                symbol_id,
                symbol: symbol.to_string(),
                base_asset_id,
                quote_asset_id,
                base_scale,
                quote_scale,
                maker_fee_rate,
                taker_fee_rate,
            },
        );
        Ok(())
    }

    pub fn symbol_id(&self, symbol: &str) -> Option<SymbolId> {
        self.symbol_to_id.get(symbol).copied()
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&SymbolInfo> {
        self.symbols.get(&id)
    }

    pub fn symbol_by_name(&self, symbol: &str) -> Option<&SymbolInfo> {
        self.symbol_id(symbol).and_then(|id| self.symbols.get(&id))
    }

    pub fn asset(&self, id: AssetId) -> Option<&AssetInfo> {
        self.assets.get(&id)
    }

    pub fn asset_id(&self, name: &str) -> Option<AssetId> {
        self.asset_to_id.get(name).copied()
    }

    pub fn asset_name(&self, id: AssetId) -> Option<&str> {
        self.assets.get(&id).map(|a| a.name.as_str())
    }

    /// Convert a scaled asset amount to `Decimal` for display.
    pub fn amount_to_decimal(&self, asset_id: AssetId, amount: u64) -> Option<Decimal> {
        self.assets
            .get(&asset_id)
            .map(|a| money::to_decimal(amount, a.scale))
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn iter_symbols(&self) -> impl Iterator<Item = &SymbolInfo> {
        self.symbols.values()
    }

    pub fn iter_assets(&self) -> impl Iterator<Item = &AssetInfo> {
        self.assets.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn registry() -> SymbolRegistry {
        let mut reg = SymbolRegistry::new();
        reg.add_asset(1, "BTC", 8).unwrap();
        reg.add_asset(2, "USDT", 6).unwrap();
        reg.add_symbol(1, "BTCUSDT", 1, 2).unwrap();
        reg
    }

    #[test]
    fn test_symbol_decomposition_is_registry_backed() {
        let reg = registry();
        let info = reg.symbol_by_name("BTCUSDT").unwrap();
        assert_eq!(info.base_asset_id, 1);
        assert_eq!(info.quote_asset_id, 2);
        assert_eq!(reg.asset_name(info.base_asset_id), Some("BTC"));
        // Unknown symbols resolve to nothing, there is no suffix guessing.
        assert!(reg.symbol_by_name("BTCUSD").is_none());
    }

    #[test]
    fn test_parse_round_trip() {
        let reg = registry();
        let info = reg.symbol_by_name("BTCUSDT").unwrap();
        let qty = info.parse_qty(dec!(0.5)).unwrap();
        assert_eq!(qty, 50_000_000);
        assert_eq!(info.qty_to_decimal(qty), dec!(0.5));
        let price = info.parse_price(dec!(30000)).unwrap();
        assert_eq!(info.price_to_decimal(price), dec!(30000));
    }

    #[test]
    fn test_rejects_unknown_assets_and_duplicates() {
        let mut reg = registry();
        assert!(reg.add_symbol(2, "ETHUSDT", 99, 2).is_err());
        assert!(reg.add_symbol(1, "ETHUSDT", 1, 2).is_err());
        assert!(reg.add_asset(1, "ETH", 8).is_err());
        assert!(reg.add_asset(3, "ETH", 12).is_err());
    }
}
