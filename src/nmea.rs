use crate::geo::Position;

/// Decode a `$..GGA` sentence into a `Position`. Returns `None` for any other sentence,
/// a sentence with an empty position field, or one that fails to parse — the caller
/// (Caster `GET_COORDINATES` / STREAM loop) discards those lines and keeps reading,
/// per spec section 4.1.
///
/// Field layout per spec section 6: field 2 is `ddmm.mmmm...`, field 3 is `N|S`,
/// field 4 is `dddmm.mmmm...`, field 5 is `E|W`.
pub fn parse_gga(line: &str) -> Option<Position> {
    let line = line.trim();
    let body = line.strip_prefix('$')?;
    let talker_sentence = body.split(['*', ',']).next()?;
    if !talker_sentence.ends_with("GGA") {
        return None;
    }

    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 6 {
        return None;
    }

    let lat_raw = fields[2];
    let lat_hemi = fields[3];
    let lon_raw = fields[4];
    let lon_hemi = fields[5];

    if lat_raw.is_empty() || lon_raw.is_empty() {
        return None;
    }

    let lat = decode_coordinate(lat_raw, 2)?;
    let lon = decode_coordinate(lon_raw, 3)?;

    let lat = match lat_hemi {
        "S" => -lat,
        "N" => lat,
        _ => return None,
    };
    let lon = match lon_hemi {
        "W" => -lon,
        "E" => lon,
        _ => return None,
    };

    Some(Position::new(lat, lon))
}

/// Decode `dddmm.mmmm` (or `ddmm.mmmm`) into decimal degrees. `degree_digits` is the
/// number of leading digits that form the integer degree part (2 for latitude, 3 for
/// longitude).
fn decode_coordinate(raw: &str, degree_digits: usize) -> Option<f64> {
    if raw.len() <= degree_digits {
        return None;
    }
    let degrees: f64 = raw[..degree_digits].parse().ok()?;
    let minutes: f64 = raw[degree_digits..].parse().ok()?;
    Some(degrees + minutes / 60.0)
}

/// Encode decimal degrees back into the `ddmm.mmmm` / `dddmm.mmmm` NMEA field form.
/// Used only by tests to exercise the round-trip invariant (spec section 8, property 4).
fn encode_coordinate(value_deg: f64, degree_digits: usize) -> String {
    let magnitude = value_deg.abs();
    let degrees = magnitude.trunc() as u32;
    let minutes = (magnitude - degrees as f64) * 60.0;
    format!("{:0width$}{:09.6}", degrees, minutes, width = degree_digits)
}

/// Build a minimal `$GNGGA` sentence carrying the given position, for use as an
/// outgoing handshake/keepalive payload in tests or tooling.
pub fn format_gga(pos: Position) -> String {
    let lat_hemi = if pos.lat_deg < 0.0 { 'S' } else { 'N' };
    let lon_hemi = if pos.lon_deg < 0.0 { 'W' } else { 'E' };
    format!(
        "$GNGGA,000000.00,{},{},{},{},1,12,1.0,0.0,M,0.0,M,,0000*00",
        encode_coordinate(pos.lat_deg, 2),
        lat_hemi,
        encode_coordinate(pos.lon_deg, 3),
        lon_hemi,
    )
}
