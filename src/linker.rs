//! Semantic linking: one pass over the loaded corpus that writes the
//! back-references and aggregates the export never states.
//!
//! Steps run in a fixed order:
//! - structures learn their owning site,
//! - site events tie entities to sites (and mark ruins), curse interactions
//!   mark figures,
//! - collections stamp their member events and gather per-kind aggregates,
//! - occasions stamp their sub-collections.
//!
//! References to ids that are not in the corpus are skipped and counted.
use std::collections::BTreeMap;
use indexmap::IndexSet;
use serde::Serialize;

use crate::corpus::Corpus;
use crate::record::{Record, Value, UNSET};

// ------------------------------ Vocabulary ------------------------------- //

pub const SITE: &str = "Site";
pub const ENTITY: &str = "Entity";
pub const HISTORICAL_FIGURE: &str = "HistoricalFigure";
pub const HISTORICAL_EVENT: &str = "HistoricalEvent";
pub const HISTORICAL_EVENT_COLLECTION: &str = "HistoricalEventCollection";

/// A site event: which payload fields name entities, and what it does to the
/// site's ruin flag.
struct SiteEvent {
    variant: &'static str,
    civs: &'static [&'static str],
    ruin: Option<bool>,
}

const SITE_EVENTS: [SiteEvent; 5] = [
    SiteEvent { variant: "CreatedSite", civs: &["civ_id", "site_civ_id"], ruin: None },
    SiteEvent { variant: "DestroyedSite", civs: &["defender_civ_id", "site_civ_id"], ruin: Some(true) },
    SiteEvent {
        variant: "SiteTakenOver",
        civs: &["attacker_civ_id", "site_civ_id", "defender_civ_id", "new_site_civ_id"],
        ruin: None,
    },
    SiteEvent { variant: "HfDestroyedSite", civs: &["site_civ_id", "defender_civ_id"], ruin: Some(true) },
    SiteEvent { variant: "ReclaimSite", civs: &["site_civ_id"], ruin: Some(false) },
];

const CURSES: [(&str, &str); 2] = [
    ("DEITY_CURSE_WEREBEAST_", "werebeast"),
    ("DEITY_CURSE_VAMPIRE_", "vampire"),
];

const ABDUCTEES: [(&str, &str); 1] = [("HfAbducted", "target_hfid")];

const BEAST_ATTACKERS: [(&str, &str); 6] = [
    ("HfSimpleBattleEvent", "group_1_hfid"),
    ("HfAttackedSite", "attacker_hfid"),
    ("HfDestroyedSite", "attacker_hfid"),
    ("AddHfEntityLink", "hfid"),
    ("CreatureDevoured", "eater"),
    ("ItemStolen", "histfig"),
];

const OCCASION_PARTS: [&str; 4] = ["Ceremony", "Competition", "Performance", "Procession"];

/// Counters per step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub structures: usize,
    pub entity_sites: usize,
    pub ruin_updates: usize,
    pub curses: usize,
    pub event_memberships: usize,
    pub aggregates: usize,
    pub occasions: usize,
    pub dangling: usize,
}

pub fn link(corpus: &mut Corpus) -> LinkReport {
    let mut report = LinkReport::default();
    assign_structure_sites(corpus, &mut report);
    link_site_events(corpus, &mut report);
    link_collections(corpus, &mut report);
    link_occasions(corpus, &mut report);
    report
}

// ------------------------------- Steps ----------------------------------- //

fn assign_structure_sites(corpus: &mut Corpus, report: &mut LinkReport) {
    let Some(sites) = corpus.collection_mut(SITE) else { return };
    for (&site_id, site) in sites.iter_mut() {
        let Some(Value::List(structures)) = site.get_mut("structures") else { continue };
        for structure in structures.iter_mut() {
            if let Value::Record(structure) = structure {
                structure.set("site_id", Value::Int(site_id));
                report.structures += 1;
            }
        }
    }
}

fn link_site_events(corpus: &mut Corpus, report: &mut LinkReport) {
    let Some(events) = corpus.take(HISTORICAL_EVENT) else { return };
    for event in events.values() {
        let Some(payload) = event.payload() else { continue };
        let details = &payload.record;

        if payload.name == "HfDoesInteraction" {
            mark_cursed(corpus, details, report);
            continue;
        }
        let Some(rule) = SITE_EVENTS.iter().find(|r| r.variant == payload.name) else { continue };
        let site_id = details.get_int("site_id");
        for civ in rule.civs {
            add_entity_site(corpus, details.get_int(civ), site_id, report);
        }
        if let Some(ruin) = rule.ruin {
            match corpus.get_mut(SITE, site_id) {
                Some(site) => {
                    site.set("ruin", Value::Bool(ruin));
                    report.ruin_updates += 1;
                }
                None => note_dangling(report, SITE, site_id),
            }
        }
    }
    corpus.put(HISTORICAL_EVENT, events);
}

fn add_entity_site(corpus: &mut Corpus, entity_id: i64, site_id: i64, report: &mut LinkReport) {
    if entity_id == UNSET || site_id == UNSET {
        return;
    }
    let Some(entity) = corpus.get_mut(ENTITY, entity_id) else {
        note_dangling(report, ENTITY, entity_id);
        return;
    };
    if entity.add_unique_int("sites", site_id) {
        report.entity_sites += 1;
    }
    if let Some(site) = corpus.get_mut(SITE, site_id) {
        site.add_unique_int("entities", entity_id);
    }
}

fn mark_cursed(corpus: &mut Corpus, details: &Record, report: &mut LinkReport) {
    let interaction = details.get_str("interaction");
    let Some((_, flag)) = CURSES.iter().find(|(prefix, _)| interaction.starts_with(prefix)) else {
        return;
    };
    let target = details.get_int("target_hfid");
    match corpus.get_mut(HISTORICAL_FIGURE, target) {
        Some(figure) => {
            figure.set(flag, Value::Bool(true));
            report.curses += 1;
        }
        None => note_dangling(report, HISTORICAL_FIGURE, target),
    }
}

fn link_collections(corpus: &mut Corpus, report: &mut LinkReport) {
    let Some(mut collections) = corpus.take(HISTORICAL_EVENT_COLLECTION) else { return };
    if let Some(events) = corpus.collection_mut(HISTORICAL_EVENT) {
        stamp_members(&mut collections, events, report);
    }
    corpus.put(HISTORICAL_EVENT_COLLECTION, collections);
}

fn stamp_members(
    collections: &mut BTreeMap<i64, Record>,
    events: &mut BTreeMap<i64, Record>,
    report: &mut LinkReport,
) {
    for (&collection_id, collection) in collections.iter_mut() {
        let members = member_ids(collection, "event");
        for id in &members {
            match events.get_mut(id) {
                Some(event) => {
                    event.set("collection", Value::Int(collection_id));
                    report.event_memberships += 1;
                }
                None => note_dangling(report, HISTORICAL_EVENT, *id),
            }
        }

        let Some(payload) = collection.payload_mut() else { continue };
        let member_events: Vec<&Record> = members.iter().filter_map(|id| events.get(id)).collect();
        let aggregate = match payload.name.as_str() {
            "Abduction" => Some(("target_hfids", distinct_ids(member_events.iter().copied(), &ABDUCTEES))),
            "BeastAttack" => {
                Some(("attacker_hfids", distinct_ids(member_events.iter().copied(), &BEAST_ATTACKERS)))
            }
            "Journey" => first_travellers(member_events.iter().copied()).map(|ids| ("traveller_hfids", ids)),
            _ => None,
        };
        if let Some((key, ids)) = aggregate {
            payload.record.set(key, Value::List(ids.into_iter().map(Value::Int).collect()));
            report.aggregates += 1;
        }
    }
}

fn link_occasions(corpus: &mut Corpus, report: &mut LinkReport) {
    let Some(collections) = corpus.collection_mut(HISTORICAL_EVENT_COLLECTION) else { return };

    let stamps: Vec<(i64, i64)> = collections
        .iter()
        .filter(|(_, c)| c.variant() == Some("Occasion"))
        .flat_map(|(&occasion, c)| member_ids(c, "eventcol").into_iter().map(move |sub| (sub, occasion)))
        .collect();

    for (sub, occasion) in stamps {
        let Some(part) = collections.get_mut(&sub) else {
            note_dangling(report, HISTORICAL_EVENT_COLLECTION, sub);
            continue;
        };
        if let Some(payload) = part.payload_mut().filter(|p| OCCASION_PARTS.contains(&p.name.as_str())) {
            payload.record.set("occasion_eventcol", Value::Int(occasion));
            report.occasions += 1;
        }
    }
}

// ------------------------------- Helpers --------------------------------- //

/// Member ids may sit on the record or, when listed after the discriminant,
/// on its payload.
fn member_ids(collection: &Record, key: &str) -> Vec<i64> {
    let own = collection.ints(key);
    let nested = collection.payload().into_iter().flat_map(|p| p.record.ints(key));
    own.chain(nested).collect()
}

/// First-seen order, no repeats, no unset ids.
fn distinct_ids<'r>(events: impl Iterator<Item = &'r Record>, sources: &[(&str, &str)]) -> Vec<i64> {
    let mut seen: IndexSet<i64> = IndexSet::new();
    for event in events {
        let Some(payload) = event.payload() else { continue };
        for (variant, field) in sources {
            if payload.name == *variant {
                seen.extend(payload.record.ints(field).filter(|&id| id != UNSET));
            }
        }
    }
    seen.into_iter().collect()
}

/// Group of the first travel event; later ones are ignored.
fn first_travellers<'r>(mut events: impl Iterator<Item = &'r Record>) -> Option<Vec<i64>> {
    let travel = events.find(|e| e.variant() == Some("HfTravel"))?;
    Some(distinct_ids(std::iter::once(travel), &[("HfTravel", "group_hfid")]))
}

fn note_dangling(report: &mut LinkReport, type_name: &str, id: i64) {
    if id != UNSET {
        tracing::trace!(%type_name, id, "dangling reference");
        report.dangling += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Payload;

    fn record(type_name: &str, id: i64, fields: &[(&str, Value)]) -> Record {
        let mut r = Record::new(type_name);
        r.set("id", Value::Int(id));
        for (k, v) in fields {
            r.set(k, v.clone());
        }
        r
    }

    fn with_payload(mut parent: Record, variant: &str, fields: &[(&str, Value)]) -> Record {
        let mut details = Record::new(&format!("{}{variant}", parent.type_name()));
        for (k, v) in fields {
            details.set(k, v.clone());
        }
        parent.set_payload(Payload { variant: 0, name: variant.to_string(), record: details });
        parent
    }

    fn event(id: i64, variant: &str, fields: &[(&str, Value)]) -> Record {
        with_payload(record(HISTORICAL_EVENT, id, &[]), variant, fields)
    }

    fn collection(id: i64, variant: &str, members: &[(&str, &[i64])]) -> Record {
        let lists: Vec<(&str, Value)> = members
            .iter()
            .map(|(k, ids)| (*k, Value::List(ids.iter().copied().map(Value::Int).collect())))
            .collect();
        with_payload(record(HISTORICAL_EVENT_COLLECTION, id, &lists), variant, &[])
    }

    fn ints(xs: &[i64]) -> Value {
        Value::List(xs.iter().copied().map(Value::Int).collect())
    }

    fn corpus(parts: Vec<(&str, Vec<Record>)>) -> Corpus {
        let mut corpus = Corpus::default();
        for (type_name, records) in parts {
            corpus.put(type_name, records.into_iter().map(|r| (r.id(), r)).collect());
        }
        corpus
    }

    fn aggregate(corpus: &Corpus, id: i64, key: &str) -> Vec<i64> {
        let c = corpus.get(HISTORICAL_EVENT_COLLECTION, id).unwrap();
        c.payload().unwrap().record.ints(key).collect()
    }

    #[test]
    fn created_then_destroyed_site() {
        let mut corpus = corpus(vec![
            (SITE, vec![record(SITE, 12, &[])]),
            (ENTITY, vec![record(ENTITY, 5, &[])]),
            (HISTORICAL_EVENT, vec![
                event(1, "CreatedSite", &[("civ_id", Value::Int(5)), ("site_id", Value::Int(12))]),
                event(2, "DestroyedSite", &[("defender_civ_id", Value::Int(5)), ("site_id", Value::Int(12))]),
            ]),
        ]);
        let report = link(&mut corpus);

        let entity = corpus.get(ENTITY, 5).unwrap();
        assert_eq!(entity.ints("sites").collect::<Vec<_>>(), vec![12]);
        let site = corpus.get(SITE, 12).unwrap();
        assert!(site.get_bool("ruin"));
        assert_eq!(site.ints("entities").collect::<Vec<_>>(), vec![5]);
        assert_eq!(report.entity_sites, 1);
        assert_eq!(report.dangling, 0);
    }

    #[test]
    fn reclaim_clears_ruin() {
        let mut corpus = corpus(vec![
            (SITE, vec![record(SITE, 3, &[])]),
            (HISTORICAL_EVENT, vec![
                event(1, "HfDestroyedSite", &[("site_id", Value::Int(3))]),
                event(2, "ReclaimSite", &[("site_id", Value::Int(3)), ("site_civ_id", Value::Int(40))]),
            ]),
        ]);
        let report = link(&mut corpus);
        assert!(!corpus.get(SITE, 3).unwrap().get_bool("ruin"));
        assert_eq!(report.ruin_updates, 2);
        // entity 40 is not in the corpus
        assert_eq!(report.dangling, 1);
    }

    #[test]
    fn abduction_targets_are_distinct_in_first_seen_order() {
        let mut corpus = corpus(vec![
            (HISTORICAL_EVENT, vec![
                event(1, "HfAbducted", &[("target_hfid", Value::Int(7))]),
                event(2, "HfAbducted", &[("target_hfid", Value::Int(9))]),
                event(3, "HfAbducted", &[("target_hfid", Value::Int(7))]),
                event(4, "HfAbducted", &[("target_hfid", Value::Int(UNSET))]),
            ]),
            (HISTORICAL_EVENT_COLLECTION, vec![collection(100, "Abduction", &[("event", &[1, 2, 3, 4])])]),
        ]);
        link(&mut corpus);
        assert_eq!(aggregate(&corpus, 100, "target_hfids"), vec![7, 9]);
        for id in 1..=4 {
            assert_eq!(corpus.get(HISTORICAL_EVENT, id).unwrap().get_int("collection"), 100);
        }
    }

    #[test]
    fn abduction_ignores_unrelated_members_and_is_stable() {
        let build = || {
            corpus(vec![
                (HISTORICAL_EVENT, vec![
                    event(1, "HfAbducted", &[("target_hfid", Value::Int(7))]),
                    event(2, "ChangeHfState", &[("hfid", Value::Int(8))]),
                    event(3, "HfAbducted", &[("target_hfid", Value::Int(9))]),
                ]),
                (HISTORICAL_EVENT_COLLECTION, vec![collection(50, "Abduction", &[("event", &[1, 2, 3])])]),
            ])
        };
        let (mut first, mut second) = (build(), build());
        assert_eq!(link(&mut first), link(&mut second));
        assert_eq!(aggregate(&first, 50, "target_hfids"), vec![7, 9]);
        assert_eq!(first, second);
        assert_eq!(first.get(HISTORICAL_EVENT, 2).unwrap().get_int("collection"), 50);
    }

    #[test]
    fn beast_attackers_come_from_every_attack_kind() {
        let mut corpus = corpus(vec![
            (HISTORICAL_EVENT, vec![
                event(1, "HfSimpleBattleEvent", &[("group_1_hfid", Value::Int(30))]),
                event(2, "CreatureDevoured", &[("eater", Value::Int(31))]),
                event(3, "ItemStolen", &[("histfig", Value::Int(30))]),
                event(4, "HfAttackedSite", &[("attacker_hfid", Value::Int(32))]),
                event(5, "ChangeHfState", &[("hfid", Value::Int(99))]),
            ]),
            (HISTORICAL_EVENT_COLLECTION, vec![collection(7, "BeastAttack", &[("event", &[1, 2, 3, 4, 5, 404])])]),
        ]);
        let report = link(&mut corpus);
        assert_eq!(aggregate(&corpus, 7, "attacker_hfids"), vec![30, 31, 32]);
        assert_eq!(report.dangling, 1);
    }

    #[test]
    fn journey_takes_the_first_travel_group() {
        let mut corpus = corpus(vec![
            (HISTORICAL_EVENT, vec![
                event(1, "HfTravel", &[("group_hfid", ints(&[3, 4]))]),
                event(2, "HfTravel", &[("group_hfid", ints(&[5]))]),
            ]),
            (HISTORICAL_EVENT_COLLECTION, vec![collection(8, "Journey", &[("event", &[1, 2])])]),
        ]);
        link(&mut corpus);
        assert_eq!(aggregate(&corpus, 8, "traveller_hfids"), vec![3, 4]);
    }

    #[test]
    fn occasions_stamp_their_parts() {
        let mut corpus = corpus(vec![
            (HISTORICAL_EVENT, vec![]),
            (HISTORICAL_EVENT_COLLECTION, vec![
                collection(200, "Occasion", &[("eventcol", &[201, 202, 999])]),
                collection(201, "Ceremony", &[]),
                collection(202, "Journey", &[]),
            ]),
        ]);
        let report = link(&mut corpus);
        let stamped = |id| corpus.get(HISTORICAL_EVENT_COLLECTION, id).unwrap().payload().unwrap().record.get_int("occasion_eventcol");
        assert_eq!(stamped(201), 200);
        assert_eq!(stamped(202), UNSET);
        assert_eq!((report.occasions, report.dangling), (1, 1));
    }

    #[test]
    fn structures_and_curses() {
        let site = record(SITE, 2, &[(
            "structures",
            Value::List(vec![Value::Record(Box::new(record("Structure", 0, &[])))]),
        )]);
        let mut corpus = corpus(vec![
            (SITE, vec![site]),
            (HISTORICAL_FIGURE, vec![record(HISTORICAL_FIGURE, 8, &[])]),
            (HISTORICAL_EVENT, vec![
                event(1, "HfDoesInteraction", &[
                    ("interaction", Value::Str("DEITY_CURSE_WEREBEAST_12".into())),
                    ("target_hfid", Value::Int(8)),
                ]),
                event(2, "HfDoesInteraction", &[
                    ("interaction", Value::Str("SECRET_10".into())),
                    ("target_hfid", Value::Int(8)),
                ]),
            ]),
        ]);
        link(&mut corpus);

        let figure = corpus.get(HISTORICAL_FIGURE, 8).unwrap();
        assert!(figure.get_bool("werebeast"));
        assert!(!figure.get_bool("vampire"));
        let Some(Value::List(structures)) = corpus.get(SITE, 2).unwrap().get("structures") else {
            panic!("structures missing")
        };
        assert_eq!(structures[0].as_record().unwrap().get_int("site_id"), 2);
    }
}
