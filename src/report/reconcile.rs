//! Final reconciliation over the ledger of sent confirmations.
//!
//! `최종결산` lists performances with a number each; `결산<N>` shows the buyers of one
//! performance with registered cancellations taken out. A registration cancels one matching
//! ledger record across the whole ledger, so a buyer with two orders and one cancellation
//! still counts once.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;
use teloxide::utils::html;

use super::store::performance_key;
use super::DIVIDER;
use crate::config::Performance;
use crate::model::{CancelledOrder, SmsRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformanceLedger {
    pub key: String,
    pub name: String,
    pub date: String,
    pub records: Vec<SmsRecord>,
}

impl PerformanceLedger {
    pub fn tickets(&self) -> u32 {
        self.records.iter().map(|r| r.quantity).sum()
    }
}

/// Records of one performance split by registered cancellations.
#[derive(Debug, Default)]
pub struct Settlement<'a> {
    pub kept: Vec<&'a SmsRecord>,
    pub removed: Vec<&'a SmsRecord>,
}

impl Settlement<'_> {
    pub fn tickets(&self) -> u32 {
        self.kept.iter().map(|r| r.quantity).sum()
    }
}

/// Splits every group's records into kept and cancelled, one settlement per group.
///
/// Each cancellation consumes exactly one record across all groups, taken in group order, so
/// a registration without a known product cannot cancel the same buyer in two performances.
pub fn settle<'a>(
    groups: &'a [PerformanceLedger],
    cancelled: &[CancelledOrder],
) -> Vec<Settlement<'a>> {
    let mut used = HashSet::new();
    groups
        .iter()
        .map(|group| {
            let mut settlement = Settlement::default();
            for record in &group.records {
                let hit = cancelled.iter().enumerate().position(|(j, c)| {
                    !used.contains(&j)
                        && c.buyer_name == record.buyer_name
                        && c.phone_last4 == record.phone_last4
                        && (c.product.is_empty() || c.product == record.product)
                });
                match hit {
                    Some(j) => {
                        used.insert(j);
                        settlement.removed.push(record);
                    }
                    None => settlement.kept.push(record),
                }
            }
            settlement
        })
        .collect()
}

/// Ledger records per performance, latest record per order ID, sorted by performance date.
pub fn group_by_performance(
    records: Vec<SmsRecord>,
    performances: &BTreeMap<String, Performance>,
) -> Vec<PerformanceLedger> {
    let mut latest: BTreeMap<String, SmsRecord> = BTreeMap::new();
    let mut order = Vec::new();
    for record in records {
        if !latest.contains_key(&record.order_id) {
            order.push(record.order_id.clone());
        }
        latest.insert(record.order_id.clone(), record);
    }

    let mut groups: BTreeMap<String, PerformanceLedger> = BTreeMap::new();
    for order_id in order {
        let Some(record) = latest.remove(&order_id) else {
            continue;
        };
        let (key, _) = performance_key(&record.product);
        let group = groups.entry(key.clone()).or_insert_with(|| {
            let (name, date) = match performances.get(&key) {
                Some(p) => (p.name.clone(), p.date.clone()),
                None => (key.replace('_', " "), String::new()),
            };
            PerformanceLedger {
                key,
                name,
                date,
                records: Vec::new(),
            }
        });
        group.records.push(record);
    }

    let mut groups: Vec<PerformanceLedger> = groups.into_values().collect();
    groups.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.key.cmp(&b.key)));
    groups
}

fn title(group: &PerformanceLedger) -> String {
    if group.date.is_empty() {
        group.name.clone()
    } else {
        format!("{} {}", group.name, group.date)
    }
}

pub fn format_reconcile_list(groups: &[PerformanceLedger], cancelled: &[CancelledOrder]) -> String {
    if groups.is_empty() {
        return "📭 문자 발송 기록이 없습니다.".to_string();
    }
    let mut msg = format!("📋 <b>최종결산</b>\n{DIVIDER}\n");
    let mut grand_total = 0;
    for (i, (group, settlement)) in groups.iter().zip(settle(groups, cancelled)).enumerate() {
        let tickets = settlement.tickets();
        grand_total += tickets;
        let _ = write!(
            msg,
            "\n{}. {} - {}건 / {}매",
            i + 1,
            title(group),
            settlement.kept.len(),
            tickets
        );
    }
    let _ = write!(
        msg,
        "\n\n🎯 <b>전체: {grand_total}매</b> (취소 제외)\n\n<b>결산1</b>처럼 번호를 붙여 보내면 명단을 보여드려요."
    );
    msg
}

/// Buyer list of the group at `index`, or `None` when there is no such group.
pub fn format_reconcile_detail(
    groups: &[PerformanceLedger],
    index: usize,
    cancelled: &[CancelledOrder],
) -> Option<String> {
    let group = groups.get(index)?;
    let Settlement { kept, removed } = settle(groups, cancelled).into_iter().nth(index)?;
    let mut msg = format!("🧾 <b>{}</b>\n{DIVIDER}\n", title(group));

    for (i, record) in kept.iter().enumerate() {
        let _ = write!(
            msg,
            "\n{}. {} ({}) - {} {}매",
            i + 1,
            html::escape(&record.buyer_name),
            record.phone_last4,
            record.seat,
            record.quantity
        );
    }
    if !removed.is_empty() {
        msg.push_str("\n\n❌ <b>취소</b>");
        for record in &removed {
            let _ = write!(
                msg,
                "\n• {} ({}) - {} {}매",
                html::escape(&record.buyer_name),
                record.phone_last4,
                record.seat,
                record.quantity
            );
        }
    }

    let tickets: u32 = kept.iter().map(|r| r.quantity).sum();
    let _ = write!(
        msg,
        "\n\n{DIVIDER}\n발송 {}건 / 취소 {}건\n🎯 <b>최종: {}매</b>",
        kept.len(),
        removed.len(),
        tickets
    );
    Some(msg)
}

pub fn format_cancelled_list(cancelled: &[CancelledOrder]) -> String {
    if cancelled.is_empty() {
        return "📭 등록된 취소 건이 없습니다.".to_string();
    }
    let mut msg = format!("❌ <b>취소 등록 목록 ({}건)</b>\n", cancelled.len());
    for c in cancelled {
        let product = if c.product.is_empty() {
            String::new()
        } else {
            let (key, seat) = performance_key(&c.product);
            format!(" - {} {}", key.replace('_', " "), seat)
        };
        let _ = write!(
            msg,
            "\n• {} ({}){}",
            html::escape(&c.buyer_name),
            c.phone_last4,
            product
        );
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppSettings;
    use chrono::Utc;

    const DAEGU: &str = "[대구] MelON(멜론) 디즈니 + 지브리 오케스트라 콘서트 [비지정석] 대구, S석";
    const BUSAN: &str = "[부산] MelON(멜론) 지브리 & 뮤지컬 콘서트 [비지정석] 부산, R석";

    fn record(order_id: &str, buyer: &str, last4: &str, product: &str, quantity: u32) -> SmsRecord {
        SmsRecord {
            order_id: order_id.to_string(),
            buyer_name: buyer.to_string(),
            phone_last4: last4.to_string(),
            product: product.to_string(),
            seat: crate::model::seat_of(product).unwrap_or_default(),
            quantity,
            sent_at: Utc::now(),
        }
    }

    fn cancellation(buyer: &str, last4: &str) -> CancelledOrder {
        CancelledOrder {
            buyer_name: buyer.to_string(),
            phone_last4: last4.to_string(),
            product: String::new(),
            cancelled_at: Utc::now(),
        }
    }

    fn groups() -> Vec<PerformanceLedger> {
        group_by_performance(
            vec![
                record("1", "홍길동", "5678", DAEGU, 2),
                record("2", "김철수", "1111", BUSAN, 1),
                record("3", "홍길동", "5678", DAEGU, 1),
                record("1", "홍길동", "5678", DAEGU, 2),
            ],
            &AppSettings::default().performances,
        )
    }

    #[test]
    fn groups_are_deduplicated_and_sorted() {
        let groups = groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "대구 디즈니+지브리");
        assert_eq!(groups[0].records.len(), 2);
        assert_eq!(groups[0].tickets(), 3);
        assert_eq!(groups[1].key, "부산_지브리");
    }

    #[test]
    fn each_cancellation_removes_one_record() {
        let groups = groups();
        let settled = settle(&groups, &[cancellation("홍길동", "5678")]);
        assert_eq!(settled[0].kept.len(), 1);
        assert_eq!(settled[0].removed.len(), 1);
        assert_eq!(settled[0].removed[0].order_id, "1");

        let settled = settle(&groups, &[cancellation("홍길동", "0000")]);
        assert_eq!(settled[0].kept.len(), 2);
    }

    #[test]
    fn cancellation_without_product_is_consumed_once_across_performances() {
        let groups = group_by_performance(
            vec![
                record("1", "홍길동", "5678", DAEGU, 2),
                record("2", "홍길동", "5678", BUSAN, 1),
            ],
            &AppSettings::default().performances,
        );
        assert_eq!(groups.len(), 2);

        let cancelled = [cancellation("홍길동", "5678")];
        let settled = settle(&groups, &cancelled);
        let removed: usize = settled.iter().map(|s| s.removed.len()).sum();
        assert_eq!(removed, 1);
        assert_eq!(settled[0].removed[0].order_id, "1");
        assert_eq!(settled[1].kept.len(), 1);

        let text = format_reconcile_list(&groups, &cancelled);
        assert!(text.contains("전체: 1매"));
        let busan = format_reconcile_detail(&groups, 1, &cancelled).unwrap();
        assert!(busan.contains("발송 1건 / 취소 0건"));
    }

    #[test]
    fn list_numbers_performances() {
        let text = format_reconcile_list(&groups(), &[cancellation("김철수", "1111")]);
        assert!(text.contains("\n1. 대구 디즈니+지브리 3/15(일) - 2건 / 3매"));
        assert!(text.contains("\n2. 부산 지브리&뮤지컬 4/4(토) - 0건 / 0매"));
        assert!(text.contains("전체: 3매"));
        assert_eq!(format_reconcile_list(&[], &[]), "📭 문자 발송 기록이 없습니다.");
    }

    #[test]
    fn detail_shows_buyers_and_cancellations() {
        let groups = groups();
        let text = format_reconcile_detail(&groups, 0, &[cancellation("홍길동", "5678")]).unwrap();
        assert!(text.contains("\n1. 홍길동 (5678) - S석 1매"));
        assert!(text.contains("❌ <b>취소</b>\n• 홍길동 (5678) - S석 2매"));
        assert!(text.ends_with("발송 1건 / 취소 1건\n🎯 <b>최종: 1매</b>"));
        assert_eq!(format_reconcile_detail(&groups, 2, &[]), None);
    }

    #[test]
    fn cancelled_list() {
        assert!(format_cancelled_list(&[]).contains("없습니다"));
        let mut c = cancellation("홍길동", "5678");
        c.product = DAEGU.to_string();
        let text = format_cancelled_list(&[c]);
        assert!(text.contains("• 홍길동 (5678) - 대구 디즈니 S석"));
    }
}
