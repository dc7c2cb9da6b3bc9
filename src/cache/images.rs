use super::albums::{adjust_image_counters, AlbumProvider};
use super::dates::parse_server_date_millis;
use super::models::{is_video_file, server_directory, smart_albums, ImageSize, ImageSizes};
use crate::api::{paging_total_count, ImageData, ImageQuery, ImageSort, PiwigoApi, ServerVersion};
use crate::db::{
    add_image_to_album, current_timestamp_millis, delete_image_rows, find_images, insert_image,
    load_image_album_ids, load_images_in_album, remove_image_from_album, update_image, Database,
    ImageRecord, StorageResult,
};
use crate::error::CacheError;
use crate::upload_manager::models::Account;
use rusqlite::Connection;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// `import_images` 每个事务合并的图片数。
pub const IMAGE_BATCH_SIZE: usize = 25;

/// 列表顺序无法说明位置时写入的 rank。
pub const UNRANKED: i64 = i64::MIN;

/// 本地缓存的图片部分。
#[derive(Clone)]
pub struct ImageProvider {
    db: Database,
    cache_dir: PathBuf,
    albums: AlbumProvider,
}

/// 导入后的一页列表结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedPage {
    pub imported: usize,
    /// 整个列表的图片总数。
    pub total_count: i64,
}

impl ImageProvider {
    pub fn new(db: Database, cache_dir: PathBuf, albums: AlbumProvider) -> Self {
        Self {
            db,
            cache_dir,
            albums,
        }
    }

    pub fn albums(&self) -> &AlbumProvider {
        &self.albums
    }

    /// 挂在相册下的图片，手动 rank 优先。
    pub fn images_in_album(&self, account: &Account, album_id: i64) -> Result<Vec<ImageRecord>, CacheError> {
        let mut images = self.db.with_connection(|conn| {
            load_images_in_album(conn, &account.server_path, &account.username, album_id)
        })?;
        images.sort_by_key(|image| (image.rank_manual, image.pwg_id));
        Ok(images)
    }

    pub fn image(&self, account: &Account, image_id: i64) -> Result<Option<ImageRecord>, CacheError> {
        Ok(self
            .db
            .with_connection(|conn| find_images(conn, &account.server_path, image_id))?
            .into_iter()
            .next())
    }

    /// 拉取相册列表的一页并合并进缓存。
    pub fn fetch_images(
        &self,
        api: &dyn PiwigoApi,
        account: &Account,
        version: ServerVersion,
        query: &ImageQuery,
    ) -> Result<ImportedPage, CacheError> {
        let page = api.get_images(query)?;
        let imported = self.import_images(
            account,
            &page.images,
            query.album_id,
            query.sort,
            page.page,
            page.per_page,
            false,
        )?;
        let total_count = paging_total_count(
            version,
            page.count,
            page.total_count,
            query.album_id == smart_albums::FAVORITES,
        );
        Ok(ImportedPage {
            imported,
            total_count,
        })
    }

    /// 合并 `album_id` 列出的图片。
    ///
    /// 手动排序与随机排序按图片在整个列表中的位置计算 rank。
    /// 开启 `with_album_update` 时，新增图片的相册会同步上调计数。
    #[allow(clippy::too_many_arguments)]
    pub fn import_images(
        &self,
        account: &Account,
        images: &[ImageData],
        album_id: i64,
        sort: ImageSort,
        page: i64,
        per_page: i64,
        with_album_update: bool,
    ) -> Result<usize, CacheError> {
        let offset = page.max(0).saturating_mul(per_page.max(0));
        let mut imported = 0;
        for (batch_index, batch) in images.chunks(IMAGE_BATCH_SIZE).enumerate() {
            let first_rank = offset.saturating_add((batch_index * IMAGE_BATCH_SIZE) as i64);
            let result = self.db.with_transaction(|tx| {
                let now = current_timestamp_millis();
                let mut outdated = Vec::new();
                let mut count = 0;
                for (index, data) in batch.iter().enumerate() {
                    let rank = sort
                        .ranks_by_position()
                        .then(|| first_rank.saturating_add(index as i64));
                    let merged = upsert_image(tx, account, data, sort, rank, now)?;
                    if let Some(stale) = merged.stale_files {
                        outdated.push(stale);
                    }
                    attach_image(tx, account, merged.row_id, data, album_id, with_album_update)?;
                    count += 1;
                }
                Ok((count, outdated))
            });
            match result {
                Ok((count, outdated)) => {
                    imported += count;
                    remove_cached_files(&self.cache_dir, &account.server_path, &outdated);
                }
                // 单个批次出错不能中断剩余列表。
                Err(err) => log::error!("[image-cache] batch {batch_index} of album {album_id} failed: {err}"),
            }
        }
        log::debug!("[image-cache] imported {imported} images in album {album_id} (page {page})");
        Ok(imported)
    }

    /// 记录服务器为本次上传创建的图片。
    pub fn did_upload_image(&self, account: &Account, image: &ImageData, category: i64) -> Result<(), CacheError> {
        self.import_images(
            account,
            std::slice::from_ref(image),
            category,
            ImageSort::DatePostedDescending,
            0,
            1,
            true,
        )?;
        log::info!("[image-cache] cached uploaded image {} in album {category}", image.id);
        Ok(())
    }

    /// 从缓存移除图片及其缓存文件，并相应下调相册计数。
    pub fn delete_images(&self, account: &Account, image_ids: &[i64]) -> Result<usize, CacheError> {
        let purged = self.db.with_transaction(|tx| {
            let mut doomed = Vec::new();
            for image_id in image_ids {
                doomed.extend(find_images(tx, &account.server_path, *image_id)?);
            }
            purge_images(tx, account, &doomed)
        })?;
        remove_cached_files(&self.cache_dir, &account.server_path, &purged);
        log::info!("[image-cache] deleted {} images", purged.len());
        Ok(purged.len())
    }
}

struct MergedImage {
    row_id: i64,
    stale_files: Option<ImageRecord>,
}

fn upsert_image(
    conn: &Connection,
    account: &Account,
    data: &ImageData,
    sort: ImageSort,
    rank: Option<i64>,
    now: i64,
) -> StorageResult<MergedImage> {
    let mut rows = find_images(conn, &account.server_path, data.id)?.into_iter();
    let existing = rows.next();
    let duplicates: Vec<i64> = rows.map(|row| row.row_id).collect();
    if !duplicates.is_empty() {
        log::warn!("[image-cache] removing {} duplicates of image {}", duplicates.len(), data.id);
        delete_image_rows(conn, &duplicates)?;
    }

    let mut candidate = image_record(account, data, existing.as_ref());
    let (rank_manual, rank_random) = match (sort, rank) {
        (ImageSort::Manual, Some(rank)) => (rank, existing.as_ref().map_or(UNRANKED, |e| e.rank_random)),
        (ImageSort::Random, Some(rank)) => (existing.as_ref().map_or(UNRANKED, |e| e.rank_manual), rank),
        _ => existing
            .as_ref()
            .map_or((UNRANKED, UNRANKED), |e| (e.rank_manual, e.rank_random)),
    };
    candidate.rank_manual = rank_manual;
    candidate.rank_random = rank_random;

    match existing {
        Some(existing) => {
            candidate.updated_at_millis = existing.updated_at_millis;
            if candidate == existing {
                return Ok(MergedImage {
                    row_id: existing.row_id,
                    stale_files: None,
                });
            }
            candidate.updated_at_millis = now;
            update_image(conn, &candidate)?;
            let old_sizes = ImageSizes::from_json(&existing.sizes);
            let new_sizes = ImageSizes::from_json(&candidate.sizes);
            let edited = existing.md5_sum != candidate.md5_sum
                || old_sizes.full_res_url() != new_sizes.full_res_url();
            Ok(MergedImage {
                row_id: existing.row_id,
                stale_files: edited.then_some(existing),
            })
        }
        None => {
            candidate.updated_at_millis = now;
            let row_id = insert_image(conn, &candidate)?;
            Ok(MergedImage {
                row_id,
                stale_files: None,
            })
        }
    }
}

fn image_record(account: &Account, data: &ImageData, existing: Option<&ImageRecord>) -> ImageRecord {
    let file_name = data.file_name.clone().unwrap_or_default();
    let sizes = ImageSizes::from_derivatives(
        &data.derivatives,
        data.full_res_url.as_deref(),
        data.width,
        data.height,
    );
    ImageRecord {
        row_id: existing.map(|image| image.row_id).unwrap_or_default(),
        server_path: account.server_path.clone(),
        pwg_id: data.id,
        uuid: existing
            .map(|image| image.uuid.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        title: data.title.clone().unwrap_or_default(),
        comment: data.comment.clone().unwrap_or_default(),
        visits: data.visits,
        rating_score: data.rating_score.unwrap_or(-1.0),
        file_size: data.file_size_kb.saturating_mul(1024),
        md5_sum: data.md5_sum.clone().unwrap_or_default(),
        is_video: is_video_file(&file_name),
        file_name,
        date_created_millis: parse_server_date_millis(data.date_created.as_deref()),
        date_posted_millis: parse_server_date_millis(data.date_posted.as_deref()),
        author: data.author.clone().unwrap_or_default(),
        privacy_level: data.privacy_level,
        tag_ids: data
            .tags
            .iter()
            .map(|tag| tag.id.to_string())
            .collect::<Vec<_>>()
            .join(","),
        latitude: data.latitude,
        longitude: data.longitude,
        sizes: sizes.to_json(),
        rank_manual: UNRANKED,
        rank_random: UNRANKED,
        updated_at_millis: 0,
    }
}

fn attach_image(
    conn: &Connection,
    account: &Account,
    row_id: i64,
    data: &ImageData,
    album_id: i64,
    with_album_update: bool,
) -> StorageResult<()> {
    let mut album_ids = vec![album_id];
    album_ids.extend(data.categories.iter().map(|category| category.id));
    if data.is_favorite == Some(true) {
        album_ids.push(smart_albums::FAVORITES);
    }
    let mut seen = HashSet::new();
    for id in album_ids {
        if !seen.insert(id) {
            continue;
        }
        let attached = add_image_to_album(conn, row_id, &account.server_path, &account.username, id)?;
        if attached && with_album_update && !smart_albums::is_smart(id) && id != smart_albums::ROOT {
            adjust_image_counters(conn, account, id, 1)?;
        }
    }
    if data.is_favorite == Some(false) && album_id != smart_albums::FAVORITES {
        remove_image_from_album(conn, row_id, &account.username, smart_albums::FAVORITES)?;
    }
    Ok(())
}

/// 先解除图片与相册的关联再删除图片行；返回被删记录，提交后再清理文件。
pub(crate) fn purge_images(
    conn: &Connection,
    account: &Account,
    images: &[ImageRecord],
) -> StorageResult<Vec<ImageRecord>> {
    let mut purged = Vec::with_capacity(images.len());
    for image in images {
        for album_id in load_image_album_ids(conn, image.row_id, &account.username)? {
            remove_image_from_album(conn, image.row_id, &account.username, album_id)?;
            if !smart_albums::is_smart(album_id) && album_id != smart_albums::ROOT {
                adjust_image_counters(conn, account, album_id, -1)?;
            }
        }
        if delete_image_rows(conn, &[image.row_id])? > 0 {
            purged.push(image.clone());
        }
    }
    Ok(purged)
}

pub(crate) fn cached_file_path(cache_dir: &Path, server_path: &str, size: ImageSize, image_id: i64) -> PathBuf {
    cache_dir
        .join(server_directory(server_path))
        .join(size.directory())
        .join(image_id.to_string())
}

/// 删除 `images` 所有尺寸的缓存文件。
pub(crate) fn remove_cached_files(cache_dir: &Path, server_path: &str, images: &[ImageRecord]) {
    for image in images {
        for size in ImageSize::ALL {
            let path = cached_file_path(cache_dir, server_path, size, image.pwg_id);
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("[image-cache] removed {path:?}"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => log::warn!("[image-cache] failed to remove {path:?}: {err}"),
            }
        }
    }
}
