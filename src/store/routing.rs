use sqlx::SqlitePool;

/// Current editor roster, in insertion order. Fetched fresh by every caller;
/// never cached across delivery rounds.
pub async fn get_editor_ids(pool: &SqlitePool) -> anyhow::Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT user_id FROM editors ORDER BY created_at, user_id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

pub async fn get_active_target_channels(pool: &SqlitePool) -> anyhow::Result<Vec<String>> {
    let channels = sqlx::query_scalar::<_, String>(
        r#"
        SELECT channel_identifier FROM target_channels
        WHERE is_active = 1
        ORDER BY created_at, id
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(channels)
}

pub async fn get_config_value(pool: &SqlitePool, key: &str) -> anyhow::Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

/// Channels whose keyword group has at least one marker word contained in
/// `text` (case-insensitive substring). De-duplicated: multiple matching
/// groups bound to the same channel yield it once, in group order.
pub async fn get_target_channels_by_text(
    pool: &SqlitePool,
    text: &str,
) -> anyhow::Result<Vec<String>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as::<_, (String, String)>(
        r#"
        SELECT tc.channel_identifier, k.word
        FROM keyword_groups kg
        JOIN target_channels tc ON kg.target_channel_id = tc.id AND tc.is_active = 1
        JOIN keywords k ON k.group_id = kg.id
        ORDER BY kg.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let text_lower = text.to_lowercase();
    let mut matched = Vec::new();
    for (channel, word) in rows {
        let word = word.trim().to_lowercase();
        if !word.is_empty() && text_lower.contains(&word) && !matched.contains(&channel) {
            matched.push(channel);
        }
    }
    Ok(matched)
}

/// Full channel-resolution chain for publication: keyword-routed channels,
/// else all active target channels, else the static fallback. An empty
/// result means publication must be refused, never silently skipped.
pub async fn get_channels_for_publish(
    pool: &SqlitePool,
    text: &str,
    static_fallback: Option<&str>,
) -> anyhow::Result<Vec<String>> {
    let routed = get_target_channels_by_text(pool, text).await?;
    if !routed.is_empty() {
        return Ok(routed);
    }
    let active = get_active_target_channels(pool).await?;
    if !active.is_empty() {
        return Ok(active);
    }
    let configured = get_config_value(pool, "target_channel").await?;
    let fallback = configured
        .as_deref()
        .or(static_fallback)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    Ok(fallback.map(|s| vec![s.to_string()]).unwrap_or_default())
}


#[cfg(test)]
mod tests {
    use super::seed::*;
    use super::*;
    use crate::store::test_pool;

    #[tokio::test]
    async fn marker_word_routes_to_bound_channel_case_insensitive() {
        let pool = test_pool().await;
        let physics = add_target_channel(&pool, "@physics", true).await;
        let biology = add_target_channel(&pool, "@biology", true).await;
        let g1 = add_keyword_group(&pool, "physics", physics).await;
        let g2 = add_keyword_group(&pool, "biology", biology).await;
        add_keyword(&pool, "quantum", g1).await;
        add_keyword(&pool, "genome", g2).await;

        let channels = get_target_channels_by_text(&pool, "Advances in QUANTUM computing")
            .await
            .unwrap();
        assert_eq!(channels, vec!["@physics"]);
    }

    #[tokio::test]
    async fn groups_sharing_a_channel_collapse_to_one_publish() {
        let pool = test_pool().await;
        let science = add_target_channel(&pool, "@science", true).await;
        let g1 = add_keyword_group(&pool, "quantum", science).await;
        let g2 = add_keyword_group(&pool, "lasers", science).await;
        add_keyword(&pool, "quantum", g1).await;
        add_keyword(&pool, "laser", g2).await;

        let channels = get_target_channels_by_text(&pool, "quantum laser breakthrough")
            .await
            .unwrap();
        assert_eq!(channels, vec!["@science"]);
    }

    #[tokio::test]
    async fn inactive_channels_are_not_routed() {
        let pool = test_pool().await;
        let dormant = add_target_channel(&pool, "@dormant", false).await;
        let group = add_keyword_group(&pool, "g", dormant).await;
        add_keyword(&pool, "quantum", group).await;

        let channels = get_target_channels_by_text(&pool, "quantum").await.unwrap();
        assert!(channels.is_empty());
    }

    #[tokio::test]
    async fn resolution_falls_back_to_active_then_config() {
        let pool = test_pool().await;

        // Nothing configured at all: refuse.
        let channels = get_channels_for_publish(&pool, "no markers here", None)
            .await
            .unwrap();
        assert!(channels.is_empty());

        // Static fallback only.
        let channels = get_channels_for_publish(&pool, "no markers here", Some("@static"))
            .await
            .unwrap();
        assert_eq!(channels, vec!["@static"]);

        // Config value takes precedence over the static fallback.
        set_config(&pool, "target_channel", "@configured").await;
        let channels = get_channels_for_publish(&pool, "no markers here", Some("@static"))
            .await
            .unwrap();
        assert_eq!(channels, vec!["@configured"]);

        // Active channels take precedence over both fallbacks.
        add_target_channel(&pool, "@main", true).await;
        add_target_channel(&pool, "@second", true).await;
        let channels = get_channels_for_publish(&pool, "no markers here", None)
            .await
            .unwrap();
        assert_eq!(channels, vec!["@main", "@second"]);
    }

    #[tokio::test]
    async fn empty_roster_is_empty() {
        let pool = test_pool().await;
        assert!(get_editor_ids(&pool).await.unwrap().is_empty());
        add_editor(&pool, 5).await;
        add_editor(&pool, 7).await;
        assert_eq!(get_editor_ids(&pool).await.unwrap(), vec![5, 7]);
    }
}
