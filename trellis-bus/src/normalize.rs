//! Normalisation des valeurs de commande.
//!
//! Sous-protocole enfichable : les bornes de pourcentage, l'auto-détection
//! de format couleur ou les deltas relatifs varient selon les capacités du
//! device, donc rien n'est codé en dur dans le runtime. Chaque connecteur
//! enregistre les normaliseurs qui le concernent.

use serde_json::{json, Value};

/// Un normaliseur transforme une valeur entrante avant application.
/// `current` est la dernière valeur connue de la propriété (si cachée).
pub trait ValueNormalizer: Send + Sync {
    /// Propriété ciblée ; `None` = le normaliseur s'applique par forme de valeur.
    fn property(&self) -> Option<&str> {
        None
    }

    /// `None` = pas de transformation (la valeur passe telle quelle).
    fn normalize(&self, property: &str, incoming: &Value, current: Option<&Value>) -> Option<Value>;
}

/// Chaîne de normaliseurs appliquée dans l'ordre d'enregistrement.
#[derive(Default)]
pub struct NormalizerSet {
    normalizers: Vec<Box<dyn ValueNormalizer>>,
}

impl NormalizerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, normalizer: Box<dyn ValueNormalizer>) {
        self.normalizers.push(normalizer);
    }

    pub fn apply(&self, property: &str, incoming: &Value, current: Option<&Value>) -> Value {
        let mut value = incoming.clone();
        for n in &self.normalizers {
            if let Some(target) = n.property() {
                if target != property {
                    continue;
                }
            }
            if let Some(normalized) = n.normalize(property, &value, current) {
                value = normalized;
            }
        }
        value
    }
}

/// Borne une propriété numérique dans [min, max] (typiquement 0..100).
pub struct PercentBounds {
    property: String,
    min: f64,
    max: f64,
}

impl PercentBounds {
    pub fn new(property: impl Into<String>, min: f64, max: f64) -> Self {
        Self { property: property.into(), min, max }
    }
}

impl ValueNormalizer for PercentBounds {
    fn property(&self) -> Option<&str> {
        Some(&self.property)
    }

    fn normalize(&self, _property: &str, incoming: &Value, _current: Option<&Value>) -> Option<Value> {
        let n = incoming.as_f64()?;
        let clamped = n.clamp(self.min, self.max);
        if clamped == n {
            None
        } else {
            Some(json!(clamped))
        }
    }
}

/// Applique les deltas relatifs `"+N"` / `"-N"` sur la valeur courante.
pub struct RelativeDelta;

impl ValueNormalizer for RelativeDelta {
    fn normalize(&self, _property: &str, incoming: &Value, current: Option<&Value>) -> Option<Value> {
        let s = incoming.as_str()?;
        let first = s.chars().next()?;
        if first != '+' && first != '-' {
            return None;
        }
        let delta: f64 = s.parse().ok()?;
        let base = current?.as_f64()?;
        Some(json!(base + delta))
    }
}

/// Auto-détection du format couleur : accepte `"#RRGGBB"`, `"r,g,b"` ou un
/// objet `{r,g,b}`, et produit toujours l'objet `{r,g,b}`.
pub struct ColorFormat {
    property: String,
}

impl ColorFormat {
    pub fn new(property: impl Into<String>) -> Self {
        Self { property: property.into() }
    }

    fn rgb(r: u8, g: u8, b: u8) -> Value {
        json!({"r": r, "g": g, "b": b})
    }
}

impl ValueNormalizer for ColorFormat {
    fn property(&self) -> Option<&str> {
        Some(&self.property)
    }

    fn normalize(&self, _property: &str, incoming: &Value, _current: Option<&Value>) -> Option<Value> {
        match incoming {
            Value::String(s) => {
                if let Some(hex) = s.strip_prefix('#') {
                    // Hex ASCII uniquement avant de découper : une entrée
                    // multi-octets ferait paniquer le slicing par index.
                    if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
                        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
                        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
                        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
                        return Some(Self::rgb(r, g, b));
                    }
                    return None;
                }
                let parts: Vec<u8> = s.split(',').map(|p| p.trim().parse().ok()).collect::<Option<_>>()?;
                if parts.len() == 3 {
                    Some(Self::rgb(parts[0], parts[1], parts[2]))
                } else {
                    None
                }
            }
            // Objet déjà au bon format : on laisse passer.
            Value::Object(_) => None,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> NormalizerSet {
        let mut s = NormalizerSet::new();
        s.register(Box::new(RelativeDelta));
        s.register(Box::new(PercentBounds::new("brightness", 0.0, 100.0)));
        s.register(Box::new(ColorFormat::new("color")));
        s
    }

    #[test]
    fn test_percent_clamped() {
        let s = set();
        assert_eq!(s.apply("brightness", &json!(150), None), json!(100.0));
        assert_eq!(s.apply("brightness", &json!(-3), None), json!(0.0));
        assert_eq!(s.apply("brightness", &json!(42), None), json!(42));
    }

    #[test]
    fn test_relative_delta_then_clamp() {
        let s = set();
        // "+30" sur 90 → 120 → borné à 100
        assert_eq!(s.apply("brightness", &json!("+30"), Some(&json!(90))), json!(100.0));
        assert_eq!(s.apply("brightness", &json!("-15"), Some(&json!(50))), json!(35.0));
        // Pas de valeur courante : le delta passe tel quel
        assert_eq!(s.apply("brightness", &json!("+30"), None), json!("+30"));
    }

    #[test]
    fn test_color_autodetect() {
        let s = set();
        assert_eq!(s.apply("color", &json!("#ff8000"), None), json!({"r": 255, "g": 128, "b": 0}));
        assert_eq!(s.apply("color", &json!("10, 20, 30"), None), json!({"r": 10, "g": 20, "b": 30}));
        let already = json!({"r": 1, "g": 2, "b": 3});
        assert_eq!(s.apply("color", &already, None), already);
    }

    #[test]
    fn test_color_rejects_malformed_hex() {
        let s = set();
        // Entrée non-ASCII de 6 octets : passe telle quelle, sans panique
        let hostile = json!("#a\u{ff}\u{ff}a");
        assert_eq!(s.apply("color", &hostile, None), hostile);
        assert_eq!(s.apply("color", &json!("#zzzzzz"), None), json!("#zzzzzz"));
        assert_eq!(s.apply("color", &json!("#fff"), None), json!("#fff"));
    }

    #[test]
    fn test_unrelated_property_untouched() {
        let s = set();
        assert_eq!(s.apply("power", &json!(true), None), json!(true));
    }
}
