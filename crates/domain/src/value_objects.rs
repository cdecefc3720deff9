use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 地球平均半径（公里）。
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// 用户唯一标识。
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<UserId> for Uuid {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl FromStr for UserId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<Uuid>()
            .map(Self)
            .map_err(|e| DomainError::validation_error("user_id", e.to_string()))
    }
}

/// 经纬度坐标。
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// 创建经过范围校验的坐标
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, DomainError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DomainError::validation_error(
                "latitude",
                "必须位于 -90 到 90 之间",
            ));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DomainError::validation_error(
                "longitude",
                "必须位于 -180 到 180 之间",
            ));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// 两点之间的大圆距离（公里，haversine 公式）
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.latitude.to_radians().cos()
                * other.latitude.to_radians().cos()
                * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

impl FromStr for Coordinates {
    type Err = DomainError;

    /// 解析 `lat,lng` 形式的文本
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lng) = s
            .split_once(',')
            .ok_or_else(|| DomainError::validation_error("coordinates", "格式应为 lat,lng"))?;
        let latitude = lat
            .trim()
            .parse::<f64>()
            .map_err(|e| DomainError::validation_error("latitude", e.to_string()))?;
        let longitude = lng
            .trim()
            .parse::<f64>()
            .map_err(|e| DomainError::validation_error("longitude", e.to_string()))?;
        Self::new(latitude, longitude)
    }
}

/// 经过校验的邮箱。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserEmail(String);

impl UserEmail {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::validation_error("email", "不能为空"));
        }
        if !value.contains('@') {
            return Err(DomainError::validation_error("email", "必须包含 '@'"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 邮箱 `@` 之前的部分
    pub fn local_part(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for UserEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_reject_out_of_range_values() {
        assert!(Coordinates::new(91.0, 0.0).is_err());
        assert!(Coordinates::new(0.0, -180.5).is_err());
        assert!(Coordinates::new(f64::NAN, 0.0).is_err());
        assert!(Coordinates::new(52.37, 4.89).is_ok());
    }

    #[test]
    fn distance_between_amsterdam_and_utrecht() {
        let amsterdam = Coordinates::new(52.3676, 4.9041).unwrap();
        let utrecht = Coordinates::new(52.0907, 5.1214).unwrap();

        let distance = amsterdam.distance_km(&utrecht);
        assert!((distance - 34.0).abs() < 1.5, "distance was {distance}");
        assert_eq!(amsterdam.distance_km(&amsterdam), 0.0);
    }

    #[test]
    fn coordinates_parse_from_text() {
        let parsed: Coordinates = " 40.7128 , -74.0060 ".parse().unwrap();
        assert_eq!(parsed.latitude, 40.7128);
        assert_eq!(parsed.longitude, -74.0060);

        assert!("40.7128".parse::<Coordinates>().is_err());
        assert!("abc,1".parse::<Coordinates>().is_err());
    }

    #[test]
    fn email_local_part() {
        let email = UserEmail::parse("jane.doe@example.com").unwrap();
        assert_eq!(email.local_part(), "jane.doe");
        assert!(UserEmail::parse("   ").is_err());
        assert!(UserEmail::parse("no-at-sign").is_err());
    }
}
