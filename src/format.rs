//! Brazilian-style display formatting for prices, mileage and locations.

/// Group an integer with `.` as the thousands separator.
fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    grouped
}

/// `139900.0` → `R$ 139.900`, `1234.5` → `R$ 1.234,50`.
pub fn format_price(price: f64) -> String {
    let sign = if price < 0.0 { "-" } else { "" };
    let cents = (price.abs() * 100.0).round() as u64;
    let reais = cents / 100;
    let rest = cents % 100;
    if rest == 0 {
        format!("{sign}R$ {}", group_thousands(reais))
    } else {
        format!("{sign}R$ {},{rest:02}", group_thousands(reais))
    }
}

/// `45000` → `45.000 km`
pub fn format_mileage(km: i64) -> String {
    let sign = if km < 0 { "-" } else { "" };
    format!("{sign}{} km", group_thousands(km.unsigned_abs()))
}

/// `Campinas` + `sp` → `Campinas/SP`. Either half may be missing.
pub fn format_location(city: Option<&str>, state: Option<&str>) -> Option<String> {
    let city = city.map(str::trim).filter(|c| !c.is_empty());
    let state = state
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase);
    match (city, state) {
        (Some(city), Some(state)) => Some(format!("{city}/{state}")),
        (Some(city), None) => Some(city.to_string()),
        (None, Some(state)) => Some(state),
        (None, None) => None,
    }
}

/// Round a similarity score to three decimals for display and comparison.
pub fn round_score(score: f32) -> f32 {
    (score * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(139_900.0), "R$ 139.900");
        assert_eq!(format_price(1_234.5), "R$ 1.234,50");
        assert_eq!(format_price(999.0), "R$ 999");
        assert_eq!(format_price(0.0), "R$ 0");
        assert_eq!(format_price(1_000_000.0), "R$ 1.000.000");
    }

    #[test]
    fn test_format_mileage() {
        assert_eq!(format_mileage(45_000), "45.000 km");
        assert_eq!(format_mileage(0), "0 km");
        assert_eq!(format_mileage(123), "123 km");
    }

    #[test]
    fn test_format_location() {
        assert_eq!(
            format_location(Some("Campinas"), Some("sp")).as_deref(),
            Some("Campinas/SP")
        );
        assert_eq!(format_location(Some("Recife"), None).as_deref(), Some("Recife"));
        assert_eq!(format_location(Some("  "), Some("")), None);
    }

    #[test]
    fn test_round_score() {
        assert_eq!(round_score(0.123_456), 0.123);
        assert_eq!(round_score(0.999_9), 1.0);
    }
}
