//! Risk-based position sizing shared by the simulator and the router.

/// Notional for a trade risking `risk_amount` between `entry` and `stop`.
///
/// notional = min(risk_amount * entry / |entry - stop|, leverage_cap, max_notional)
///
/// `max_notional` applies only when positive. Returns `None` when the stop
/// distance is zero, prices are not positive, or the result is not a
/// positive finite number.
pub fn position_notional(
    risk_amount: f64,
    entry: f64,
    stop: f64,
    leverage_cap: f64,
    max_notional: Option<f64>,
) -> Option<f64> {
    let distance = (entry - stop).abs();
    if !(distance > 0.0 && entry > 0.0 && risk_amount > 0.0) {
        return None;
    }
    let mut notional = (risk_amount * entry / distance).min(leverage_cap);
    if let Some(cap) = max_notional.filter(|c| *c > 0.0) {
        notional = notional.min(cap);
    }
    (notional.is_finite() && notional > 0.0).then_some(notional)
}
