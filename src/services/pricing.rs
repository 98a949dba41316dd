use crate::config::AppConfig;
use rust_decimal::Decimal;

/// Delivery-charge collaborator: a pure function of postal code and subtotal.
pub trait DeliveryPricing: Send + Sync {
    fn quote(&self, postal_code: &str, subtotal: Decimal) -> Decimal;
}

/// Flat charge below a free-delivery threshold, plus a surcharge for remote
/// postal areas that applies regardless of the threshold.
#[derive(Debug, Clone)]
pub struct StandardDeliveryPricing {
    pub base_charge: Decimal,
    pub free_threshold: Decimal,
    pub remote_prefixes: Vec<String>,
    pub remote_surcharge: Decimal,
}

impl StandardDeliveryPricing {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_charge: config.delivery_base_charge,
            free_threshold: config.free_delivery_threshold,
            remote_prefixes: config.remote_prefixes(),
            remote_surcharge: config.remote_delivery_surcharge,
        }
    }

    fn is_remote(&self, postal_code: &str) -> bool {
        let code = postal_code.trim();
        self.remote_prefixes
            .iter()
            .any(|prefix| code.starts_with(prefix.as_str()))
    }
}

impl DeliveryPricing for StandardDeliveryPricing {
    fn quote(&self, postal_code: &str, subtotal: Decimal) -> Decimal {
        let base = if subtotal >= self.free_threshold {
            Decimal::ZERO
        } else {
            self.base_charge
        };

        if self.is_remote(postal_code) {
            base + self.remote_surcharge
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn pricing() -> StandardDeliveryPricing {
        StandardDeliveryPricing {
            base_charge: dec!(40),
            free_threshold: dec!(500),
            remote_prefixes: vec!["79".into(), "18".into()],
            remote_surcharge: dec!(60),
        }
    }

    #[rstest]
    #[case("560001", dec!(120), dec!(40))]
    #[case("560001", dec!(500), dec!(0))]
    #[case("560001", dec!(499.99), dec!(40))]
    #[case("790001", dec!(120), dec!(100))]
    #[case("180005", dec!(900), dec!(60))]
    fn quotes_delivery_charge(
        #[case] postal_code: &str,
        #[case] subtotal: Decimal,
        #[case] expected: Decimal,
    ) {
        assert_eq!(pricing().quote(postal_code, subtotal), expected);
    }
}
