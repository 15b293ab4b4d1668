//! State of charge from pack voltage for a 16-cell LiFePO4 battery

/// Resting voltage to SOC points, highest first.
pub const LIFEPO4_16S_CURVE: [(f64, u8); 12] = [
    (57.6, 100),
    (56.0, 99),
    (54.4, 95),
    (53.6, 90),
    (53.2, 80),
    (52.8, 70),
    (52.4, 60),
    (52.0, 50),
    (51.6, 40),
    (51.2, 30),
    (50.4, 17),
    (48.0, 0),
];

/// Interpolate the discharge curve; truncates to whole percent.
pub fn voltage_to_soc(voltage: f64) -> u8 {
    let (top_v, top_soc) = LIFEPO4_16S_CURVE[0];
    let (bottom_v, bottom_soc) = LIFEPO4_16S_CURVE[LIFEPO4_16S_CURVE.len() - 1];
    if voltage.is_nan() || voltage <= bottom_v {
        return bottom_soc;
    }
    if voltage >= top_v {
        return top_soc;
    }

    for pair in LIFEPO4_16S_CURVE.windows(2) {
        let (v_high, soc_high) = pair[0];
        let (v_low, soc_low) = pair[1];
        if voltage >= v_low {
            let ratio = (voltage - v_low) / (v_high - v_low);
            let soc = f64::from(soc_low) + ratio * (f64::from(soc_high) - f64::from(soc_low));
            return soc.clamp(0.0, 100.0) as u8;
        }
    }
    bottom_soc
}
