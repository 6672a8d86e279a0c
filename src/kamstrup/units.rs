/// Maps the unit byte of a register response to its display string.
///
/// Codes are taken from the Kamstrup meter protocol; temperatures and
/// volumes are normalized to `°C` and `m³`. Unknown codes return `None`.
pub fn unit_from_code(code: u8) -> Option<&'static str> {
    let unit = match code {
        0 => "",
        1 => "Wh",
        2 => "kWh",
        3 => "MWh",
        4 => "GWh",
        5 => "J",
        6 => "kJ",
        7 => "MJ",
        8 => "GJ",
        9 => "Cal",
        10 => "kCal",
        11 => "MCal",
        12 => "GCal",
        13 => "varh",
        14 => "kvarh",
        15 => "Mvarh",
        16 => "Gvarh",
        17 => "VAh",
        18 => "kVAh",
        19 => "MVAh",
        20 => "GVAh",
        21 => "W",
        22 => "kW",
        23 => "MW",
        24 => "GW",
        25 => "var",
        26 => "kvar",
        27 => "Mvar",
        28 => "Gvar",
        29 => "VA",
        30 => "kVA",
        31 => "MVA",
        32 => "GVA",
        33 => "V",
        34 => "A",
        35 => "kV",
        36 => "kA",
        37 => "°C",
        38 => "K",
        39 => "l",
        40 => "m³",
        41 => "l/h",
        42 => "m³/h",
        43 => "m³×°C",
        44 => "ton",
        45 => "ton/h",
        46 => "h",
        47 => "hh:mm:ss",
        48 => "yy:mm:dd",
        49 => "yyyy:mm:dd",
        50 => "mm:dd",
        51 => "",
        52 => "bar",
        53 => "RTC",
        54 => "ASCII",
        55 => "m³ × 10",
        56 => "ton × 10",
        57 => "GJ × 10",
        58 => "min",
        59 => "Bitfield",
        60 => "s",
        61 => "ms",
        62 => "days",
        63 => "RTC-Q",
        64 => "Datetime",
        _ => return None,
    };

    Some(unit)
}
