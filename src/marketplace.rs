//! Supported marketplaces and their OAuth endpoints.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// External sales channel exposing an OAuth2-protected API.
///
/// Adding a marketplace means adding a variant here plus its env prefix and
/// default endpoints below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marketplace {
    MercadoLivre,
    Amazon,
    Shopee,
}

impl Marketplace {
    /// Every supported marketplace, in a stable order.
    pub const ALL: [Marketplace; 3] = [
        Marketplace::MercadoLivre,
        Marketplace::Amazon,
        Marketplace::Shopee,
    ];

    /// Canonical name used in storage and config (`mercado_livre`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::MercadoLivre => "mercado_livre",
            Marketplace::Amazon => "amazon",
            Marketplace::Shopee => "shopee",
        }
    }

    /// Prefix of the `{PREFIX}_CLIENT_ID` / `_CLIENT_SECRET` / `_REDIRECT_URI` keys.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Marketplace::MercadoLivre => "ML",
            Marketplace::Amazon => "AMAZON",
            Marketplace::Shopee => "SHOPEE",
        }
    }

    /// Default authorization/token endpoints (production).
    pub fn default_endpoints(&self) -> OAuthEndpoints {
        let (auth_url, token_url) = match self {
            Marketplace::MercadoLivre => (
                "https://auth.mercadolivre.com.br/authorization",
                "https://api.mercadolibre.com/oauth/token",
            ),
            Marketplace::Amazon => (
                "https://sellercentral.amazon.com.br/apps/authorize/consent",
                "https://api.amazon.com/auth/o2/token",
            ),
            Marketplace::Shopee => (
                "https://partner.shopeemobile.com/api/v2/shop/auth_partner",
                "https://partner.shopeemobile.com/api/v2/auth/token/get",
            ),
        };

        OAuthEndpoints {
            auth_url: auth_url.to_string(),
            token_url: token_url.to_string(),
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Marketplace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mercado_livre" => Ok(Marketplace::MercadoLivre),
            "amazon" => Ok(Marketplace::Amazon),
            "shopee" => Ok(Marketplace::Shopee),
            other => Err(Error::UnsupportedMarketplace(other.to_string())),
        }
    }
}

/// Authorization-server endpoints for one marketplace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthEndpoints {
    /// Where the user is sent to grant access
    pub auth_url: String,

    /// Where codes and refresh tokens are exchanged
    pub token_url: String,
}
