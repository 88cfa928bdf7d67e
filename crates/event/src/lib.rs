#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The canonical enriched-event model: a flat record of optional string
//! fields, mutable during enrichment, serialized to one tab-separated UTF-8
//! row with fields in a fixed canonical order.

macro_rules! enriched_event {
    ($($field:ident),+ $(,)?) => {
        /// One canonical enriched event.
        ///
        /// Every field is an optional string; enrichments mutate fields in
        /// place and later enrichments may overwrite what earlier ones
        /// wrote. Serialization renders absent fields as empty columns.
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct EnrichedEvent {
            $(
                #[doc = concat!("The `", stringify!($field), "` canonical field.")]
                pub $field: Option<String>,
            )+
        }

        /// Names of the canonical fields, in serialization order.
        pub const FIELD_NAMES: &[&str] = &[$(stringify!($field)),+];

        impl EnrichedEvent {
            /// Creates an empty event.
            pub fn new() -> Self {
                Default::default()
            }

            /// Returns the value of the field selected by its canonical
            /// name, or `None` when the name is unknown or the field is
            /// unset.
            pub fn get(&self, name: &str) -> Option<&str> {
                match name {
                    $(stringify!($field) => self.$field.as_deref(),)+
                    _ => None,
                }
            }

            /// Sets the field selected by its canonical name. Returns false
            /// when the name is not a canonical field.
            pub fn set(&mut self, name: &str, value: impl Into<String>) -> bool {
                match name {
                    $(stringify!($field) => {
                        self.$field = Some(value.into());
                        true
                    },)+
                    _ => false,
                }
            }

            /// Serializes the event to one tab-separated row, fields in
            /// canonical order.
            pub fn to_tsv(&self) -> String {
                let fields: Vec<&str> = vec![$(self.$field.as_deref().unwrap_or("")),+];
                fields.join("\t")
            }
        }
    };
}

enriched_event! {
    app_id, platform, etl_tstamp, collector_tstamp, dvce_created_tstamp,
    event, event_id, txn_id, name_tracker, v_tracker, v_collector, v_etl,
    user_id, user_ipaddress, user_fingerprint, domain_userid,
    domain_sessionidx, network_userid, geo_country, geo_region, geo_city,
    geo_zipcode, geo_latitude, geo_longitude, geo_region_name, ip_isp,
    ip_organization, ip_domain, ip_netspeed, page_url, page_title,
    page_referrer, page_urlscheme, page_urlhost, page_urlport, page_urlpath,
    page_urlquery, page_urlfragment, refr_urlscheme, refr_urlhost,
    refr_urlport, refr_urlpath, refr_urlquery, refr_urlfragment, refr_medium,
    refr_source, refr_term, mkt_medium, mkt_source, mkt_term, mkt_content,
    mkt_campaign, contexts, se_category, se_action, se_label, se_property,
    se_value, unstruct_event, tr_orderid, tr_affiliation, tr_total, tr_tax,
    tr_shipping, tr_city, tr_state, tr_country, ti_orderid, ti_sku, ti_name,
    ti_category, ti_price, ti_quantity, pp_xoffset_min, pp_xoffset_max,
    pp_yoffset_min, pp_yoffset_max, useragent, br_name, br_family,
    br_version, br_type, br_renderengine, br_lang, br_features_pdf,
    br_features_flash, br_features_java, br_features_director,
    br_features_quicktime, br_features_realplayer, br_features_windowsmedia,
    br_features_gears, br_features_silverlight, br_cookies, br_colordepth,
    br_viewwidth, br_viewheight, os_name, os_family, os_manufacturer,
    os_timezone, dvce_type, dvce_ismobile, dvce_screenwidth,
    dvce_screenheight, doc_charset, doc_width, doc_height, tr_currency,
    tr_total_base, tr_tax_base, tr_shipping_base, ti_currency,
    ti_price_base, base_currency, geo_timezone, mkt_clickid, mkt_network,
    etl_tags, dvce_sent_tstamp, refr_domain_userid, refr_dvce_tstamp,
    derived_contexts, domain_sessionid, derived_tstamp, event_vendor,
    event_name, event_format, event_version, event_fingerprint, true_tstamp,
}

#[cfg(test)]
mod test {
    use crate::{EnrichedEvent, FIELD_NAMES};

    #[test]
    fn canonical_field_count() {
        assert_eq!(FIELD_NAMES.len(), 131);
    }

    #[test]
    fn canonical_order_spot_checks() {
        assert_eq!(FIELD_NAMES[0], "app_id");
        assert_eq!(FIELD_NAMES[3], "collector_tstamp");
        assert_eq!(FIELD_NAMES[6], "event_id");
        assert_eq!(FIELD_NAMES[11], "v_etl");
        assert_eq!(FIELD_NAMES[52], "contexts");
        assert_eq!(FIELD_NAMES[122], "derived_contexts");
        assert_eq!(FIELD_NAMES[130], "true_tstamp");
    }

    #[test]
    fn get_and_set_by_name() {
        let mut event = EnrichedEvent::new();
        assert!(event.set("app_id", "shop"));
        assert!(event.set("geo_city", "Reykjavik"));
        assert!(!event.set("not_a_field", "x"));

        assert_eq!(event.get("app_id"), Some("shop"));
        assert_eq!(event.get("geo_city"), Some("Reykjavik"));
        assert_eq!(event.get("platform"), None);
        assert_eq!(event.get("not_a_field"), None);
        assert_eq!(event.app_id.as_deref(), Some("shop"));
    }

    #[test]
    fn tsv_row_has_one_column_per_field() {
        let mut event = EnrichedEvent::new();
        event.app_id = Some("shop".into());
        event.event_id = Some("deadbeef".into());

        let row = event.to_tsv();
        let columns: Vec<&str> = row.split('\t').collect();
        assert_eq!(columns.len(), FIELD_NAMES.len());
        assert_eq!(columns[0], "shop");
        assert_eq!(columns[6], "deadbeef");
        assert_eq!(columns[1], "");
    }

    #[test]
    fn empty_event_serializes_to_tabs_only() {
        let row = EnrichedEvent::new().to_tsv();
        assert_eq!(row.chars().filter(|c| *c == '\t').count(), FIELD_NAMES.len() - 1);
        assert!(row.chars().all(|c| c == '\t'));
    }
}
