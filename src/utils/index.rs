/// Satoshis per bitcoin, as a power of ten
pub const BTC_DECIMALS: u32 = 8;

fn format_units(sign: &str, abs: u64, decimals: u32) -> String {
    if decimals == 0 {
        return format!("{}{}", sign, abs);
    }

    let scale = 10u64.pow(decimals);
    format!(
        "{}{}.{:0width$}",
        sign,
        abs / scale,
        abs % scale,
        width = decimals as usize
    )
}

/// Render a signed amount of base units with `decimals` fractional digits.
pub fn format_token_amount(amount: i64, decimals: u32) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    format_units(sign, amount.unsigned_abs(), decimals)
}

/// Render an unsigned amount of base units with `decimals` fractional digits.
pub fn format_unsigned_amount(amount: u64, decimals: u32) -> String {
    format_units("", amount, decimals)
}

pub fn format_btc_amount(sats: i64) -> String {
    format_token_amount(sats, BTC_DECIMALS)
}

/// Confirmed balances are unsigned and may exceed `i64::MAX` in aggregate.
pub fn format_btc_unsigned(sats: u64) -> String {
    format_unsigned_amount(sats, BTC_DECIMALS)
}
