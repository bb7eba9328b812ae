use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Local tables known to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Orders,
    OrderItems,
    Payments,
    CashDrawerSessions,
    CashTransactions,
    Customers,
    DeviceSettings,
    Products,
    Categories,
    Printers,
    Outbox,
}

impl Table {
    /// Tables that hold syncable records (everything except the outbox).
    pub const ENTITY_TABLES: [Table; 10] = [
        Table::Orders,
        Table::OrderItems,
        Table::Payments,
        Table::CashDrawerSessions,
        Table::CashTransactions,
        Table::Customers,
        Table::DeviceSettings,
        Table::Products,
        Table::Categories,
        Table::Printers,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Orders => "orders",
            Table::OrderItems => "order_items",
            Table::Payments => "payments",
            Table::CashDrawerSessions => "cash_drawer_sessions",
            Table::CashTransactions => "cash_transactions",
            Table::Customers => "customers",
            Table::DeviceSettings => "device_settings",
            Table::Products => "products",
            Table::Categories => "categories",
            Table::Printers => "printers",
            Table::Outbox => "outbox",
        }
    }

    /// Remote counterpart of this table, if it has one.
    pub fn remote_entity(&self) -> Option<RemoteEntity> {
        match self {
            Table::Orders => Some(RemoteEntity::Orders),
            Table::OrderItems => Some(RemoteEntity::OrderItems),
            Table::Payments => Some(RemoteEntity::Payments),
            Table::CashDrawerSessions => Some(RemoteEntity::CashDrawerSessions),
            Table::CashTransactions => Some(RemoteEntity::CashTransactions),
            Table::Customers => Some(RemoteEntity::Customers),
            Table::DeviceSettings => Some(RemoteEntity::DeviceSettings),
            Table::Products => Some(RemoteEntity::Products),
            Table::Categories => Some(RemoteEntity::Categories),
            Table::Printers | Table::Outbox => None,
        }
    }

    /// Whether local mutations on this table are recorded in the outbox.
    pub fn is_captured(&self) -> bool {
        self.remote_entity()
            .map(|entity| entity.accepts_push())
            .unwrap_or(false)
    }

    pub fn is_entity_table(&self) -> bool {
        *self != Table::Outbox
    }

    /// Per-device record whose pushed identity is the device id.
    pub fn is_device_singleton(&self) -> bool {
        *self == Table::DeviceSettings
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Table::ENTITY_TABLES
            .iter()
            .chain(std::iter::once(&Table::Outbox))
            .find(|t| t.name() == lower)
            .copied()
            .ok_or_else(|| {
                let valid: Vec<&str> = Table::ENTITY_TABLES.iter().map(|t| t.name()).collect();
                format!("Invalid table '{}'. Valid options: {}", s, valid.join(", "))
            })
    }
}

/// Entity names understood by the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteEntity {
    #[serde(rename = "OrdersPush")]
    Orders,
    #[serde(rename = "OrderItemsPush")]
    OrderItems,
    #[serde(rename = "PaymentsPush")]
    Payments,
    #[serde(rename = "CashDrawerSessionsPush")]
    CashDrawerSessions,
    #[serde(rename = "CashTransactionsPush")]
    CashTransactions,
    #[serde(rename = "CustomersPush")]
    Customers,
    #[serde(rename = "DeviceSettingsPush")]
    DeviceSettings,
    Products,
    Categories,
}

impl RemoteEntity {
    pub const ALL: [RemoteEntity; 9] = [
        RemoteEntity::Orders,
        RemoteEntity::OrderItems,
        RemoteEntity::Payments,
        RemoteEntity::CashDrawerSessions,
        RemoteEntity::CashTransactions,
        RemoteEntity::Customers,
        RemoteEntity::DeviceSettings,
        RemoteEntity::Products,
        RemoteEntity::Categories,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RemoteEntity::Orders => "OrdersPush",
            RemoteEntity::OrderItems => "OrderItemsPush",
            RemoteEntity::Payments => "PaymentsPush",
            RemoteEntity::CashDrawerSessions => "CashDrawerSessionsPush",
            RemoteEntity::CashTransactions => "CashTransactionsPush",
            RemoteEntity::Customers => "CustomersPush",
            RemoteEntity::DeviceSettings => "DeviceSettingsPush",
            RemoteEntity::Products => "Products",
            RemoteEntity::Categories => "Categories",
        }
    }

    pub fn table(&self) -> Table {
        match self {
            RemoteEntity::Orders => Table::Orders,
            RemoteEntity::OrderItems => Table::OrderItems,
            RemoteEntity::Payments => Table::Payments,
            RemoteEntity::CashDrawerSessions => Table::CashDrawerSessions,
            RemoteEntity::CashTransactions => Table::CashTransactions,
            RemoteEntity::Customers => Table::Customers,
            RemoteEntity::DeviceSettings => Table::DeviceSettings,
            RemoteEntity::Products => Table::Products,
            RemoteEntity::Categories => Table::Categories,
        }
    }

    /// Reference data (products, categories) is pull-only.
    pub fn accepts_push(&self) -> bool {
        !matches!(self, RemoteEntity::Products | RemoteEntity::Categories)
    }

    /// Entities that take part in push passes.
    pub fn pushable() -> impl Iterator<Item = RemoteEntity> {
        Self::ALL.into_iter().filter(|e| e.accepts_push())
    }
}

impl fmt::Display for RemoteEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for RemoteEntity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RemoteEntity::ALL
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(s) || e.table().name() == s)
            .copied()
            .ok_or_else(|| format!("Unknown remote entity '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_round_trips_through_table() {
        for entity in RemoteEntity::ALL {
            assert_eq!(entity.table().remote_entity(), Some(entity));
        }
    }

    #[test]
    fn test_local_only_tables_have_no_remote() {
        assert_eq!(Table::Printers.remote_entity(), None);
        assert_eq!(Table::Outbox.remote_entity(), None);
        assert!(!Table::Printers.is_captured());
        assert!(!Table::Outbox.is_captured());
    }

    #[test]
    fn test_reference_tables_are_not_captured() {
        assert!(!Table::Products.is_captured());
        assert!(!Table::Categories.is_captured());
        assert!(Table::Orders.is_captured());
        assert!(Table::DeviceSettings.is_captured());
    }

    #[test]
    fn test_table_from_str() {
        assert_eq!(Table::from_str("orders").unwrap(), Table::Orders);
        assert_eq!(
            Table::from_str("CASH_TRANSACTIONS").unwrap(),
            Table::CashTransactions
        );
        assert!(Table::from_str("receipts").is_err());
    }

    #[test]
    fn test_remote_entity_from_str_accepts_both_names() {
        assert_eq!(
            RemoteEntity::from_str("OrdersPush").unwrap(),
            RemoteEntity::Orders
        );
        assert_eq!(
            RemoteEntity::from_str("orders").unwrap(),
            RemoteEntity::Orders
        );
        assert!(RemoteEntity::from_str("Printers").is_err());
    }

    #[test]
    fn test_remote_entity_serializes_as_wire_name() {
        let json = serde_json::to_string(&RemoteEntity::Orders).unwrap();
        assert_eq!(json, "\"OrdersPush\"");
        let parsed: RemoteEntity = serde_json::from_str("\"Products\"").unwrap();
        assert_eq!(parsed, RemoteEntity::Products);
    }

    #[test]
    fn test_pushable_excludes_reference_data() {
        let pushable: Vec<RemoteEntity> = RemoteEntity::pushable().collect();
        assert_eq!(pushable.len(), 7);
        assert!(!pushable.contains(&RemoteEntity::Products));
    }
}
