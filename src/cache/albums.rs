use super::dates::{parse_server_date_millis, unknown_date_millis};
use super::images::purge_images;
use super::models::{join_rank, rank_segments, smart_albums, DeleteMode};
use crate::api::{AlbumData, PiwigoApi};
use crate::db::{
    current_timestamp_millis, delete_album_rows, find_albums, insert_album, load_albums,
    load_child_albums, load_image_album_ids, load_images_in_album, remove_album_memberships,
    update_album, AlbumRecord, Database, ImageRecord, StorageResult,
};
use crate::error::CacheError;
use crate::settings;
use crate::upload_manager::models::{Account, ServerProfile};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

/// `import_albums` 每个事务合并的相册数。
pub const ALBUM_BATCH_SIZE: usize = 256;

/// 本地缓存的相册部分。
#[derive(Clone)]
pub struct AlbumProvider {
    db: Database,
    cache_dir: PathBuf,
}

impl AlbumProvider {
    pub fn new(db: Database, cache_dir: PathBuf) -> Self {
        Self { db, cache_dir }
    }

    pub fn album(&self, account: &Account, album_id: i64) -> Result<Option<AlbumRecord>, CacheError> {
        Ok(self
            .db
            .with_connection(|conn| load_album(conn, account, album_id))?)
    }

    /// 按 rank 排序的直接子相册。
    pub fn child_albums(&self, account: &Account, parent_id: i64) -> Result<Vec<AlbumRecord>, CacheError> {
        let mut albums = self.db.with_connection(|conn| {
            load_child_albums(conn, &account.server_path, &account.username, parent_id)
        })?;
        albums.sort_by_key(|album| rank_segments(&album.global_rank));
        Ok(albums)
    }

    /// 拉取服务器相册列表并镜像到本地。
    ///
    /// Community 相册带有上传权限；读取失败时只导入基础列表。
    pub fn fetch_albums(
        &self,
        api: &dyn PiwigoApi,
        profile: &ServerProfile,
        parent_id: i64,
        recursive: bool,
    ) -> Result<usize, CacheError> {
        let mut albums = api.get_albums(parent_id, recursive)?;
        if profile.is_admin {
            albums.iter_mut().for_each(|album| album.has_upload_rights = true);
        } else if profile.community_active {
            match api.get_community_albums(parent_id, recursive) {
                Ok(community) if !community.is_empty() => merge_community_albums(&mut albums, community),
                Ok(_) => log::warn!("[album-cache] empty Community album list; importing base list"),
                Err(err) => {
                    log::warn!("[album-cache] Community album list failed ({err}); importing base list")
                }
            }
        }
        self.import_albums(&profile.account, &albums, parent_id, recursive)
    }

    /// 分批镜像服务器相册列表。缓存中属于当前范围、但列表里没有的相册
    /// 在最后一批时删除；根相册永不删除。
    pub fn import_albums(
        &self,
        account: &Account,
        albums: &[AlbumData],
        parent_id: i64,
        recursive: bool,
    ) -> Result<usize, CacheError> {
        let batches: Vec<&[AlbumData]> = if albums.is_empty() {
            vec![&[]]
        } else {
            albums.chunks(ALBUM_BATCH_SIZE).collect()
        };
        let last_batch = batches.len() - 1;
        let mut stale: Option<HashSet<i64>> = None;
        let mut imported = 0;
        let mut removed = Vec::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let pending = stale.take();
            let (count, remaining, deleted) = self.db.with_transaction(|tx| {
                let mut to_delete = match pending {
                    Some(ids) => ids,
                    None => stale_candidates(tx, account, parent_id, recursive)?,
                };
                let now = current_timestamp_millis();
                let mut count = 0;
                for data in batch {
                    if data.name.trim().is_empty() {
                        log::warn!("[album-cache] dropping album {} without name", data.id);
                        continue;
                    }
                    to_delete.remove(&data.id);
                    upsert_album(tx, account, data, now)?;
                    count += 1;
                }
                let mut deleted = Vec::new();
                if index == last_batch && !to_delete.is_empty() {
                    for album_id in &to_delete {
                        let rows = find_albums(tx, &account.server_path, &account.username, *album_id)?;
                        let row_ids: Vec<i64> = rows.iter().map(|row| row.row_id).collect();
                        delete_album_rows(tx, &row_ids)?;
                        remove_album_memberships(tx, &account.server_path, &account.username, *album_id)?;
                        log::debug!("[album-cache] deleted album {album_id}");
                        deleted.push(*album_id);
                    }
                }
                Ok((count, to_delete, deleted))
            })?;
            imported += count;
            removed.extend(deleted);
            stale = Some(remaining);
        }
        log::info!(
            "[album-cache] imported {imported} albums in {parent_id} (recursive: {recursive}), deleted {}",
            removed.len()
        );
        self.release_auto_upload_destination(&removed);
        Ok(imported)
    }

    /// 缓存刚在服务器上创建的相册，并排在同级相册的最前面。
    pub fn add_album(
        &self,
        account: &Account,
        album_id: i64,
        name: &str,
        comment: &str,
        parent_id: i64,
    ) -> Result<AlbumRecord, CacheError> {
        let album = self.db.with_transaction(|tx| {
            if let Some(existing) = load_album(tx, account, album_id)? {
                log::warn!("[album-cache] album {album_id} already cached");
                return Ok(existing);
            }
            let parent = parent_album(tx, account, parent_id)?;
            shift_sibling_ranks(tx, account, parent_id, 1, 1, None)?;
            let now = current_timestamp_millis();
            let mut album = AlbumRecord {
                server_path: account.server_path.clone(),
                username: account.username.clone(),
                pwg_id: album_id,
                uuid: Uuid::new_v4().to_string(),
                name: name.to_string(),
                comment: comment.to_string(),
                global_rank: first_rank_in(parent.as_ref()),
                parent_id,
                upper_ids: upper_ids_in(parent.as_ref(), album_id),
                date_last_millis: unknown_date_millis(),
                has_upload_rights: true,
                current_counter: 1,
                updated_at_millis: now,
                ..AlbumRecord::default()
            };
            album.row_id = insert_album(tx, &album)?;
            adjust_ancestors(tx, account, &album, 1)?;
            Ok(album)
        })?;
        log::info!("[album-cache] added album {album_id} in {parent_id}");
        Ok(album)
    }

    /// 将相册及其子相册移动到另一个父相册下，排在最前。
    pub fn move_album(&self, account: &Account, album_id: i64, new_parent_id: i64) -> Result<(), CacheError> {
        self.db.with_transaction(|tx| {
            let Some(mut album) = load_album(tx, account, album_id)? else {
                return Err(format!("album {album_id} is not cached"));
            };
            let new_parent = parent_album(tx, account, new_parent_id)?;
            if let Some(parent) = &new_parent {
                if upper_ids_of(parent).contains(&album_id) {
                    return Err(format!("cannot move album {album_id} into its own sub-album"));
                }
            }
            let descendants = load_descendants(tx, account, album_id)?;

            // 离开旧的父相册。
            adjust_ancestors(tx, account, &album, -1)?;
            let old_position = rank_segments(&album.global_rank).last().copied().unwrap_or(0);
            shift_sibling_ranks(tx, account, album.parent_id, old_position + 1, -1, Some(album_id))?;

            // 加入新的父相册。
            shift_sibling_ranks(tx, account, new_parent_id, 1, 1, Some(album_id))?;
            let old_rank = album.global_rank.clone();
            let old_upper_ids = album.upper_ids.clone();
            album.parent_id = new_parent_id;
            album.global_rank = first_rank_in(new_parent.as_ref());
            album.upper_ids = upper_ids_in(new_parent.as_ref(), album_id);
            album.updated_at_millis = current_timestamp_millis();
            update_album(tx, &album)?;
            for mut child in descendants {
                child.global_rank = replace_rank_prefix(&child.global_rank, &old_rank, &album.global_rank);
                if let Some(rest) = child.upper_ids.strip_prefix(&old_upper_ids) {
                    if rest.starts_with(',') {
                        child.upper_ids = format!("{}{rest}", album.upper_ids);
                    }
                }
                child.updated_at_millis = album.updated_at_millis;
                update_album(tx, &child)?;
            }
            adjust_ancestors(tx, account, &album, 1)?;
            Ok(())
        })?;
        log::info!("[album-cache] moved album {album_id} into {new_parent_id}");
        Ok(())
    }

    /// 删除相册及其子相册；`mode` 决定其中哪些图片一并删除。返回删除的相册数。
    pub fn delete_album(&self, account: &Account, album_id: i64, mode: DeleteMode) -> Result<usize, CacheError> {
        if album_id == smart_albums::ROOT {
            log::warn!("[album-cache] refusing to delete the root album");
            return Ok(0);
        }
        let (removed, purged) = self.db.with_transaction(|tx| {
            let Some(album) = load_album(tx, account, album_id)? else {
                return Ok((Vec::new(), Vec::new()));
            };
            let mut targets = vec![album.clone()];
            targets.extend(load_descendants(tx, account, album_id)?);
            let target_ids: HashSet<i64> = targets.iter().map(|target| target.pwg_id).collect();

            let mut doomed: Vec<ImageRecord> = Vec::new();
            if mode != DeleteMode::None {
                let mut seen = HashSet::new();
                for target in &targets {
                    for image in load_images_in_album(tx, &account.server_path, &account.username, target.pwg_id)? {
                        if !seen.insert(image.row_id) {
                            continue;
                        }
                        let keep = mode == DeleteMode::Orphaned
                            && load_image_album_ids(tx, image.row_id, &account.username)?
                                .iter()
                                .any(|id| !target_ids.contains(id) && !smart_albums::is_smart(*id));
                        if !keep {
                            doomed.push(image);
                        }
                    }
                }
            }

            adjust_ancestors(tx, account, &album, -1)?;
            let position = rank_segments(&album.global_rank).last().copied().unwrap_or(0);
            shift_sibling_ranks(tx, account, album.parent_id, position + 1, -1, Some(album_id))?;

            for target in &targets {
                remove_album_memberships(tx, &account.server_path, &account.username, target.pwg_id)?;
            }
            let row_ids: Vec<i64> = targets.iter().map(|target| target.row_id).collect();
            delete_album_rows(tx, &row_ids)?;
            let purged = purge_images(tx, account, &doomed)?;
            Ok((target_ids.into_iter().collect::<Vec<_>>(), purged))
        })?;
        super::images::remove_cached_files(&self.cache_dir, &account.server_path, &purged);
        log::info!(
            "[album-cache] deleted album {album_id} with {} albums and {} images",
            removed.len(),
            purged.len()
        );
        self.release_auto_upload_destination(&removed);
        Ok(removed.len())
    }

    pub fn update_albums_adding_images(&self, account: &Account, album_id: i64, count: i64) -> Result<(), CacheError> {
        self.db
            .with_transaction(|tx| adjust_image_counters(tx, account, album_id, count.max(0)))?;
        Ok(())
    }

    pub fn update_albums_removing_images(&self, account: &Account, album_id: i64, count: i64) -> Result<(), CacheError> {
        self.db
            .with_transaction(|tx| adjust_image_counters(tx, account, album_id, -count.max(0)))?;
        Ok(())
    }

    /// 重命名规则使用的计数器：返回当前值并自增。
    pub fn next_counter(&self, account: &Account, album_id: i64) -> Result<i64, CacheError> {
        Ok(self.db.with_transaction(|tx| {
            let Some(mut album) = load_album(tx, account, album_id)? else {
                return Ok(1);
            };
            let current = album.current_counter;
            album.current_counter = current.saturating_add(1);
            update_album(tx, &album)?;
            Ok(current)
        })?)
    }

    fn release_auto_upload_destination(&self, removed: &[i64]) {
        if removed.is_empty() {
            return;
        }
        let config = match settings::get_auto_upload_config(&self.db) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("[album-cache] cannot read auto-upload settings: {err}");
                return;
            }
        };
        if let Some(category) = config.category_id.filter(|id| removed.contains(id)) {
            log::info!("[album-cache] auto-upload album {category} deleted; disabling auto-upload");
            if let Err(err) = settings::reset_auto_upload_category(&self.db)
                .and_then(|_| settings::set_auto_upload_active(&self.db, false).map(|_| ()))
            {
                log::error!("[album-cache] failed to disable auto-upload: {err}");
            }
        }
    }
}

fn merge_community_albums(albums: &mut Vec<AlbumData>, community: Vec<AlbumData>) {
    for mut album in community {
        match albums.iter_mut().find(|known| known.id == album.id) {
            Some(known) => known.has_upload_rights = true,
            None => {
                album.has_upload_rights = true;
                albums.push(album);
            }
        }
    }
}

pub(crate) fn load_album(conn: &Connection, account: &Account, album_id: i64) -> StorageResult<Option<AlbumRecord>> {
    Ok(find_albums(conn, &account.server_path, &account.username, album_id)?
        .into_iter()
        .next())
}

fn parent_album(conn: &Connection, account: &Account, parent_id: i64) -> StorageResult<Option<AlbumRecord>> {
    if parent_id == smart_albums::ROOT {
        return Ok(None);
    }
    match load_album(conn, account, parent_id)? {
        Some(parent) => Ok(Some(parent)),
        None => Err(format!("parent album {parent_id} is not cached")),
    }
}

fn stale_candidates(
    conn: &Connection,
    account: &Account,
    parent_id: i64,
    recursive: bool,
) -> StorageResult<HashSet<i64>> {
    let albums = load_albums(conn, &account.server_path, &account.username)?;
    Ok(albums
        .into_iter()
        .filter(|album| recursive || album.pwg_id == parent_id || album.parent_id == parent_id)
        .map(|album| album.pwg_id)
        .filter(|id| *id != smart_albums::ROOT && !smart_albums::is_smart(*id))
        .collect())
}

fn upsert_album(conn: &Connection, account: &Account, data: &AlbumData, now: i64) -> StorageResult<()> {
    let mut rows = find_albums(conn, &account.server_path, &account.username, data.id)?.into_iter();
    match rows.next() {
        Some(existing) => {
            let duplicates: Vec<i64> = rows.map(|row| row.row_id).collect();
            if !duplicates.is_empty() {
                log::warn!("[album-cache] removing {} duplicates of album {}", duplicates.len(), data.id);
                delete_album_rows(conn, &duplicates)?;
            }
            let mut candidate = album_record(account, data, Some(&existing));
            candidate.updated_at_millis = existing.updated_at_millis;
            if candidate != existing {
                candidate.updated_at_millis = now;
                update_album(conn, &candidate)?;
            }
        }
        None => {
            let mut record = album_record(account, data, None);
            record.updated_at_millis = now;
            insert_album(conn, &record)?;
        }
    }
    Ok(())
}

fn album_record(account: &Account, data: &AlbumData, existing: Option<&AlbumRecord>) -> AlbumRecord {
    let upper_ids = match data.upper_cats.as_deref().map(str::trim) {
        Some(upper) if !upper.is_empty() => upper.to_string(),
        _ => data.id.to_string(),
    };
    AlbumRecord {
        row_id: existing.map(|album| album.row_id).unwrap_or_default(),
        server_path: account.server_path.clone(),
        username: account.username.clone(),
        pwg_id: data.id,
        uuid: existing
            .map(|album| album.uuid.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: data.name.clone(),
        comment: data.comment.clone().unwrap_or_default(),
        global_rank: data.global_rank.clone().unwrap_or_default(),
        parent_id: data.parent_id.unwrap_or(smart_albums::ROOT),
        upper_ids,
        image_sort: data.image_sort.clone().unwrap_or_default(),
        nb_images: data.nb_images,
        total_nb_images: data.total_nb_images,
        nb_sub_albums: data.nb_sub_albums,
        thumbnail_id: data.thumbnail_id.unwrap_or_default(),
        thumbnail_url: data.thumbnail_url.clone(),
        date_last_millis: parse_server_date_millis(data.date_last.as_deref()),
        has_upload_rights: data.has_upload_rights,
        current_counter: existing.map(|album| album.current_counter).unwrap_or(1),
        updated_at_millis: 0,
    }
}

fn upper_ids_of(album: &AlbumRecord) -> Vec<i64> {
    crate::api::models::split_ids(&album.upper_ids, ',')
}

fn first_rank_in(parent: Option<&AlbumRecord>) -> String {
    match parent {
        Some(parent) if !parent.global_rank.is_empty() => format!("{}.1", parent.global_rank),
        _ => "1".to_string(),
    }
}

fn upper_ids_in(parent: Option<&AlbumRecord>, album_id: i64) -> String {
    match parent {
        Some(parent) if !parent.upper_ids.is_empty() => format!("{},{album_id}", parent.upper_ids),
        _ => album_id.to_string(),
    }
}

fn load_descendants(conn: &Connection, account: &Account, album_id: i64) -> StorageResult<Vec<AlbumRecord>> {
    Ok(load_albums(conn, &account.server_path, &account.username)?
        .into_iter()
        .filter(|album| album.pwg_id != album_id && upper_ids_of(album).contains(&album_id))
        .collect())
}

fn replace_rank_prefix(rank: &str, old_prefix: &str, new_prefix: &str) -> String {
    match rank.strip_prefix(old_prefix) {
        Some(rest) if rest.starts_with('.') => format!("{new_prefix}{rest}"),
        _ => rank.to_string(),
    }
}

/// 将 `parent_id` 下位置不小于 `from` 的子相册的 rank 末段后移，
/// 并重写其后代的 rank。
fn shift_sibling_ranks(
    conn: &Connection,
    account: &Account,
    parent_id: i64,
    from: i64,
    delta: i64,
    exclude: Option<i64>,
) -> StorageResult<()> {
    let siblings = load_child_albums(conn, &account.server_path, &account.username, parent_id)?;
    let now = current_timestamp_millis();
    for mut sibling in siblings {
        if Some(sibling.pwg_id) == exclude {
            continue;
        }
        let mut segments = rank_segments(&sibling.global_rank);
        let Some(last) = segments.last_mut() else {
            continue;
        };
        if *last < from {
            continue;
        }
        *last += delta;
        let old_rank = std::mem::replace(&mut sibling.global_rank, join_rank(&segments));
        sibling.updated_at_millis = now;
        update_album(conn, &sibling)?;
        for mut child in load_descendants(conn, account, sibling.pwg_id)? {
            child.global_rank = replace_rank_prefix(&child.global_rank, &old_rank, &sibling.global_rank);
            child.updated_at_millis = now;
            update_album(conn, &child)?;
        }
    }
    Ok(())
}

/// 将 `album` 及其内容计入（`sign` = 1）或移出（`sign` = -1）祖先相册的计数。
fn adjust_ancestors(conn: &Connection, account: &Account, album: &AlbumRecord, sign: i64) -> StorageResult<()> {
    let sub_albums = album.nb_sub_albums.saturating_add(1).saturating_mul(sign);
    let images = album.total_nb_images.saturating_mul(sign);
    for upper_id in upper_ids_of(album) {
        if upper_id == smart_albums::ROOT || upper_id == album.pwg_id {
            continue;
        }
        if let Some(mut upper) = load_album(conn, account, upper_id)? {
            upper.nb_sub_albums = upper.nb_sub_albums.saturating_add(sub_albums).max(0);
            upper.total_nb_images = upper.total_nb_images.saturating_add(images).max(0);
            upper.updated_at_millis = current_timestamp_millis();
            update_album(conn, &upper)?;
        }
    }
    Ok(())
}

/// 对相册及其祖先的总数应用 `delta` 张图片；计数饱和且不会低于零。
pub(crate) fn adjust_image_counters(
    conn: &Connection,
    account: &Account,
    album_id: i64,
    delta: i64,
) -> StorageResult<()> {
    if delta == 0 {
        return Ok(());
    }
    let Some(mut album) = load_album(conn, account, album_id)? else {
        log::debug!("[album-cache] album {album_id} not cached; counters left alone");
        return Ok(());
    };
    let now = current_timestamp_millis();
    album.nb_images = album.nb_images.saturating_add(delta).max(0);
    album.total_nb_images = album.total_nb_images.saturating_add(delta).max(0);
    if delta > 0 {
        album.date_last_millis = album.date_last_millis.max(now);
    } else {
        album.date_last_millis = load_images_in_album(conn, &account.server_path, &account.username, album_id)?
            .iter()
            .map(|image| image.date_posted_millis)
            .max()
            .unwrap_or_else(unknown_date_millis);
    }
    if album.nb_images == 0 {
        album.thumbnail_id = 0;
        album.thumbnail_url = None;
    }
    album.updated_at_millis = now;
    update_album(conn, &album)?;

    for upper_id in upper_ids_of(&album) {
        if upper_id == smart_albums::ROOT || upper_id == album_id {
            continue;
        }
        if let Some(mut upper) = load_album(conn, account, upper_id)? {
            upper.total_nb_images = upper.total_nb_images.saturating_add(delta).max(0);
            upper.updated_at_millis = now;
            update_album(conn, &upper)?;
        }
    }
    Ok(())
}
